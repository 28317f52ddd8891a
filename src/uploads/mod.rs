//! Upload batching and temporary storage lifecycle.
//!
//! Image uploads from one member in one channel are staged in the object
//! store and merged into a single rendered message for `window`. Each batch
//! owns two timers: the batch timer drops the in-memory record after
//! `window`; the cleanup timer deletes the staged objects after
//! `window + cleanup_buffer`. Batches are tracked by id, and the per-member
//! key only points at the batch currently accepting uploads, so a batch
//! sealed by an overflow keeps its own record, message and cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chat::{Attachment, ChatAuthor, ChatPlatform, InboundMessage, MessageRef};
use crate::config::BatchConfig;
use crate::media::{Download, MediaSource};
use crate::models::{CardAuthor, OutboundFile, OutboundMessage, PreviewCard};
use crate::scheduler::{TimerHandle, Timers};
use crate::storage::{Acl, ObjectStore, Tags};

const VIDEO_REACTION: &str = "🎬";
const BATCH_COLOR: u32 = 0x0058_65F2;
const MAX_FILENAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct StagedImage {
    pub storage_key: String,
    pub public_url: String,
    pub filename: String,
    pub content_type: String,
}

struct UploadBatch {
    key: String,
    images: Vec<StagedImage>,
    video_count: usize,
    first_author: ChatAuthor,
    description: Option<String>,
    guild_id: String,
    channel_id: String,
    posted_message: Option<MessageRef>,
    first_upload: Instant,
    first_upload_at: DateTime<Utc>,
    batch_timer: TimerHandle,
}

/// Objects staged for one batch; outlives the batch record until cleanup
struct StagedSet {
    keys: Vec<String>,
    created: Instant,
    cleanup_timer: Option<TimerHandle>,
}

#[derive(Default)]
struct BatchState {
    batches: HashMap<u64, UploadBatch>,
    /// `guild:user` to the batch accepting uploads
    active: HashMap<String, u64>,
    staged: HashMap<u64, StagedSet>,
    seen_files: HashMap<String, Vec<(String, Instant)>>,
}

impl BatchState {
    fn active_batch(&self, key: &str) -> Option<(u64, &UploadBatch)> {
        let id = *self.active.get(key)?;
        self.batches.get(&id).map(|batch| (id, batch))
    }
}

/// Read-only view of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub id: u64,
    pub images: Vec<StagedImage>,
    pub video_count: usize,
    pub guild_id: String,
    pub channel_id: String,
    pub posted_message: Option<MessageRef>,
}

impl BatchSnapshot {
    fn of(id: u64, batch: &UploadBatch) -> Self {
        Self {
            id,
            images: batch.images.clone(),
            video_count: batch.video_count,
            guild_id: batch.guild_id.clone(),
            channel_id: batch.channel_id.clone(),
            posted_message: batch.posted_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Same filenames seen recently with no batch open
    DuplicateDropped,
    /// Only videos; reacted to, nothing staged
    VideoOnly,
    Batched { batch_ids: Vec<u64> },
}

pub struct UploadBatcher {
    config: BatchConfig,
    store: Arc<dyn ObjectStore>,
    media: Arc<dyn MediaSource>,
    chat: Arc<dyn ChatPlatform>,
    timers: Timers,
    state: Arc<Mutex<BatchState>>,
    next_batch_id: AtomicU64,
    render_lock: tokio::sync::Mutex<()>,
}

fn batch_key(guild_id: &str, user_id: &str) -> String {
    format!("{guild_id}:{user_id}")
}

/// Filesystem- and URL-safe version of an uploaded filename
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('.');
    let mut name = if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    };
    // keep the extension end
    if name.len() > MAX_FILENAME_LEN {
        name.drain(..name.len() - MAX_FILENAME_LEN);
    }
    name
}

/// Marks staged objects for the storage lifecycle rule
fn lifecycle_tags(batch_id: u64) -> Tags {
    Tags::from([
        ("lifecycle".to_string(), "temporary".to_string()),
        ("batch".to_string(), batch_id.to_string()),
    ])
}

async fn delete_staged(store: &dyn ObjectStore, batch_id: u64, keys: &[String]) {
    if keys.is_empty() {
        return;
    }
    match store.delete_many(keys).await {
        Ok(()) => info!(batch_id, objects = keys.len(), "cleaned up staged uploads"),
        Err(e) => error!(batch_id, error = %e, "failed to delete staged uploads"),
    }
}

impl UploadBatcher {
    pub fn new(
        config: BatchConfig,
        store: Arc<dyn ObjectStore>,
        media: Arc<dyn MediaSource>,
        chat: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            config,
            store,
            media,
            chat,
            timers: Timers::new(),
            state: Arc::new(Mutex::new(BatchState::default())),
            next_batch_id: AtomicU64::new(1),
            render_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Batch currently accepting uploads from this member
    pub fn active_batch(&self, guild_id: &str, user_id: &str) -> Option<BatchSnapshot> {
        let state = self.state.lock();
        state
            .active_batch(&batch_key(guild_id, user_id))
            .map(|(id, batch)| BatchSnapshot::of(id, batch))
    }

    pub fn batch(&self, batch_id: u64) -> Option<BatchSnapshot> {
        let state = self.state.lock();
        state
            .batches
            .get(&batch_id)
            .map(|batch| BatchSnapshot::of(batch_id, batch))
    }

    /// Storage keys still awaiting cleanup for `batch_id`
    pub fn staged_keys(&self, batch_id: u64) -> Vec<String> {
        self.state
            .lock()
            .staged
            .get(&batch_id)
            .map(|set| set.keys.clone())
            .unwrap_or_default()
    }

    pub async fn handle_upload(&self, message: &InboundMessage, guild_id: &str) -> Result<UploadOutcome> {
        let key = batch_key(guild_id, &message.author.id);
        let images: Vec<&Attachment> = message.attachments.iter().filter(|a| a.is_image()).collect();
        let video_count = message.attachments.iter().filter(|a| a.is_video()).count();

        let filenames: Vec<String> = message
            .attachments
            .iter()
            .map(|a| a.filename.clone())
            .collect();
        if self.is_duplicate_upload(&key, &filenames) {
            info!(guild = %guild_id, user = %message.author.id, "dropping duplicate upload");
            return Ok(UploadOutcome::DuplicateDropped);
        }

        if video_count > 0
            && let Err(e) = self.chat.react(&message.message_ref(), VIDEO_REACTION).await
        {
            warn!(guild = %guild_id, error = %e, "failed to react to video upload");
        }

        if images.is_empty() {
            return Ok(UploadOutcome::VideoOnly);
        }

        let target = self.select_batch(&key, message, guild_id, video_count);

        let attachment_count = images.len();
        let mut staged = Vec::with_capacity(attachment_count);
        for attachment in images {
            match self.stage(&key, target, attachment).await {
                Ok(image) => staged.push(image),
                Err(e) => warn!(
                    guild = %guild_id,
                    filename = %attachment.filename,
                    error = %e,
                    "failed to stage upload"
                ),
            }
        }
        if staged.is_empty() {
            bail!("no attachment could be staged");
        }
        let mut complete = staged.len() == attachment_count;

        let (mut touched, overflow) = self.place(&key, target, staged, message, guild_id);
        if let Some((overflow_id, images)) = overflow {
            self.relocate(target, overflow_id, &key, images).await;
            touched.push(overflow_id);
        }

        for batch_id in &touched {
            match self.render(*batch_id).await {
                Ok(all_shown) => complete &= all_shown,
                Err(e) => {
                    error!(batch_id, guild = %guild_id, error = %e, "failed to render batch");
                    complete = false;
                }
            }
        }

        // the original is the only copy of anything that did not make it
        if !complete {
            warn!(guild = %guild_id, message = %message.id, "keeping original upload, batch is partial");
        } else if let Err(e) = self.chat.delete_message(&message.message_ref()).await {
            warn!(guild = %guild_id, error = %e, "failed to delete original upload");
        }

        Ok(UploadOutcome::Batched { batch_ids: touched })
    }

    fn is_duplicate_upload(&self, key: &str, filenames: &[String]) -> bool {
        let now = Instant::now();
        let window = self.config.duplicate_window;
        let mut state = self.state.lock();
        let has_active_batch = state.active_batch(key).is_some();

        let seen = state.seen_files.entry(key.to_string()).or_default();
        seen.retain(|(_, at)| now.duration_since(*at) < window);

        let duplicate = !has_active_batch
            && filenames
                .iter()
                .any(|name| seen.iter().any(|(seen_name, _)| seen_name == name));

        if !duplicate {
            seen.extend(filenames.iter().map(|name| (name.clone(), now)));
        }
        duplicate
    }

    /// Batch to stage into, opening one when the active batch does not fit
    fn select_batch(
        &self,
        key: &str,
        message: &InboundMessage,
        guild_id: &str,
        video_count: usize,
    ) -> u64 {
        let mut state = self.state.lock();
        let reusable = state.active.get(key).copied().filter(|id| {
            state.batches.get(id).is_some_and(|batch| {
                batch.first_upload.elapsed() < self.config.window
                    && batch.channel_id == message.channel_id
                    && batch.images.len() < self.config.max_images
            })
        });

        let id = match reusable {
            Some(id) => id,
            None => self.open_batch(&mut state, key, message, guild_id),
        };
        if let Some(batch) = state.batches.get_mut(&id) {
            batch.video_count += video_count;
        }
        id
    }

    /// Open a batch and make it the active one for `key`. Caller holds the lock.
    fn open_batch(
        &self,
        state: &mut BatchState,
        key: &str,
        message: &InboundMessage,
        guild_id: &str,
    ) -> u64 {
        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let batch_timer = {
            let state = Arc::clone(&self.state);
            self.timers.schedule(self.config.window, async move {
                let mut state = state.lock();
                if let Some(batch) = state.batches.remove(&id)
                    && state.active.get(&batch.key) == Some(&id)
                {
                    state.active.remove(&batch.key);
                }
                debug!(batch_id = id, "batch window closed");
            })
        };

        let cleanup_timer = {
            let state = Arc::clone(&self.state);
            let store = Arc::clone(&self.store);
            self.timers
                .schedule(self.config.window + self.config.cleanup_buffer, async move {
                    let keys = state.lock().staged.remove(&id).map(|set| set.keys);
                    if let Some(keys) = keys {
                        delete_staged(store.as_ref(), id, &keys).await;
                    }
                })
        };

        state.staged.insert(
            id,
            StagedSet {
                keys: Vec::new(),
                created: now,
                cleanup_timer: Some(cleanup_timer),
            },
        );
        state.batches.insert(
            id,
            UploadBatch {
                key: key.to_string(),
                images: Vec::new(),
                video_count: 0,
                first_author: message.author.clone(),
                description: Some(message.content.trim().to_string()).filter(|s| !s.is_empty()),
                guild_id: guild_id.to_string(),
                channel_id: message.channel_id.clone(),
                posted_message: None,
                first_upload: now,
                first_upload_at: message.created_at,
                batch_timer,
            },
        );

        if let Some(sealed) = state.active.insert(key.to_string(), id) {
            debug!(sealed, batch_id = id, "sealed batch superseded");
        }
        id
    }

    fn object_key(&self, key: &str, batch_id: u64, filename: &str) -> String {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!(
            "{}/{:x}/{}/{}-{}-{}",
            self.config.storage_prefix.trim_end_matches('/'),
            md5::compute(key),
            batch_id,
            Utc::now().timestamp_millis(),
            suffix.to_lowercase(),
            sanitize_filename(filename)
        )
    }

    fn staged_image(&self, storage_key: String, filename: &str, content_type: String) -> StagedImage {
        StagedImage {
            public_url: self.store.public_url(&storage_key),
            storage_key,
            filename: sanitize_filename(filename),
            content_type,
        }
    }

    async fn tag_staged(&self, storage_key: &str, batch_id: u64) {
        if let Err(e) = self.store.tag(storage_key, lifecycle_tags(batch_id)).await {
            debug!(%storage_key, error = %e, "failed to tag staged upload");
        }
    }

    fn register_staged(&self, batch_id: u64, storage_key: &str) {
        let mut state = self.state.lock();
        match state.staged.get_mut(&batch_id) {
            Some(set) => set.keys.push(storage_key.to_string()),
            None => {
                // cleanup already ran; the sweep picks this one up
                state.staged.insert(
                    batch_id,
                    StagedSet {
                        keys: vec![storage_key.to_string()],
                        created: Instant::now(),
                        cleanup_timer: None,
                    },
                );
            }
        }
    }

    async fn stage(&self, key: &str, batch_id: u64, attachment: &Attachment) -> Result<StagedImage> {
        let Download::Complete { data, content_type } =
            self.media.download(&attachment.url, None).await?
        else {
            bail!("attachment {} too large to stage", attachment.filename);
        };
        let content_type = attachment
            .content_type
            .clone()
            .or(content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let storage_key = self.object_key(key, batch_id, &attachment.filename);
        self.store
            .put(&storage_key, data, &content_type, Acl::PublicRead)
            .await
            .with_context(|| format!("failed to stage {}", attachment.filename))?;
        self.register_staged(batch_id, &storage_key);
        self.tag_staged(&storage_key, batch_id).await;

        Ok(self.staged_image(storage_key, &attachment.filename, content_type))
    }

    /// Append staged images to `target`. Whatever does not fit is returned
    /// together with a freshly opened overflow batch.
    fn place(
        &self,
        key: &str,
        target: u64,
        mut staged: Vec<StagedImage>,
        message: &InboundMessage,
        guild_id: &str,
    ) -> (Vec<u64>, Option<(u64, Vec<StagedImage>)>) {
        let max = self.config.max_images;
        let mut state = self.state.lock();

        let mut touched = Vec::new();
        if let Some(batch) = state.batches.get_mut(&target) {
            let room = max.saturating_sub(batch.images.len()).min(staged.len());
            batch.images.extend(staged.drain(..room));
            if room > 0 {
                touched.push(target);
            }
        }

        if staged.is_empty() {
            return (touched, None);
        }

        info!(
            sealed = target,
            overflow = staged.len(),
            "batch full, starting overflow batch"
        );
        let overflow_id = self.open_batch(&mut state, key, message, guild_id);
        (touched, Some((overflow_id, staged)))
    }

    /// Move overflow objects under the new batch's prefix
    async fn relocate(&self, from: u64, to: u64, key: &str, images: Vec<StagedImage>) {
        for image in images {
            let new_key = self.object_key(key, to, &image.filename);
            let moved = match self.store.copy(&image.storage_key, &new_key).await {
                Ok(()) => {
                    if let Err(e) = self.store.delete_many(&[image.storage_key.clone()]).await {
                        warn!(key = %image.storage_key, error = %e, "failed to delete relocated original");
                    }
                    self.register_staged(to, &new_key);
                    self.tag_staged(&new_key, to).await;
                    if let Some(set) = self.state.lock().staged.get_mut(&from) {
                        set.keys.retain(|k| k != &image.storage_key);
                    }
                    self.staged_image(new_key, &image.filename, image.content_type.clone())
                }
                Err(e) => {
                    warn!(key = %image.storage_key, error = %e, "relocation failed, keeping original object");
                    image
                }
            };

            if let Some(batch) = self.state.lock().batches.get_mut(&to) {
                batch.images.push(moved);
            }
        }
    }

    /// Post the batch message, replacing any earlier rendering
    /// Repost the batch card. `Ok(false)` when the batch is gone or some
    /// staged image could not be fetched back.
    async fn render(&self, batch_id: u64) -> Result<bool> {
        let _render = self.render_lock.lock().await;

        let snapshot = self.state.lock().batches.get(&batch_id).map(|batch| {
            (
                BatchSnapshot::of(batch_id, batch),
                batch.first_author.clone(),
                batch.description.clone(),
                batch.first_upload_at,
            )
        });
        let Some((batch, author, description, first_upload_at)) = snapshot else {
            debug!(batch_id, "batch expired before render");
            return Ok(false);
        };

        let mut files = Vec::with_capacity(batch.images.len());
        for (index, image) in batch.images.iter().enumerate() {
            let url = self.store.cdn_url(&image.storage_key);
            match self.media.download(&url, None).await {
                Ok(Download::Complete { data, .. }) => files.push(OutboundFile {
                    filename: format!("{index}_{}", image.filename),
                    data,
                }),
                Ok(Download::TooLarge) => warn!(%url, "staged image unexpectedly too large"),
                Err(e) => warn!(%url, error = %e, "failed to fetch staged image from CDN"),
            }
        }
        let Some(first) = files.first() else {
            bail!("no staged image could be fetched for batch {batch_id}");
        };
        let all_shown = files.len() == batch.images.len();

        let card = PreviewCard {
            description,
            color: Some(BATCH_COLOR),
            timestamp: Some(first_upload_at),
            author: Some(CardAuthor {
                name: author.name,
                url: None,
                icon_url: author.avatar_url,
            }),
            image_url: Some(format!("attachment://{}", first.filename)),
            footer: (files.len() > 1).then(|| format!("{} images", files.len())),
            ..PreviewCard::default()
        };

        // attachments cannot be edited in place
        if let Some(previous) = &batch.posted_message
            && let Err(e) = self.chat.delete_message(previous).await
        {
            warn!(batch_id, error = %e, "failed to delete previous batch message");
        }

        let posted = self
            .chat
            .send(
                &batch.channel_id,
                OutboundMessage {
                    content: None,
                    cards: vec![card],
                    files,
                },
            )
            .await?;

        if let Some(live) = self.state.lock().batches.get_mut(&batch_id) {
            live.posted_message = Some(posted);
        }
        Ok(all_shown)
    }

    /// Force-clean batches and staged objects whose timers never fired
    pub async fn sweep(&self) -> usize {
        let max_age = self.config.window + self.config.cleanup_buffer;
        let duplicate_window = self.config.duplicate_window;

        let leaked: Vec<(u64, Vec<String>)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            state
                .batches
                .retain(|_, batch| batch.first_upload.elapsed() < max_age);
            let batches = &state.batches;
            state.active.retain(|_, id| batches.contains_key(id));

            let now = Instant::now();
            state.seen_files.retain(|_, seen| {
                seen.retain(|(_, at)| now.duration_since(*at) < duplicate_window);
                !seen.is_empty()
            });

            let expired: Vec<u64> = state
                .staged
                .iter()
                .filter(|(_, set)| set.created.elapsed() > max_age)
                .map(|(id, _)| *id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| {
                    let set = state.staged.remove(&id)?;
                    if let Some(timer) = &set.cleanup_timer {
                        timer.cancel();
                    }
                    Some((id, set.keys))
                })
                .collect()
        };

        for (batch_id, keys) in &leaked {
            warn!(batch_id, objects = keys.len(), "force-cleaning leaked upload batch");
            delete_staged(self.store.as_ref(), *batch_id, keys).await;
        }
        leaked.len()
    }

    /// Cancel all timers; staged objects are left to the storage lifecycle rule
    pub fn shutdown(&self) {
        let state = self.state.lock();
        for batch in state.batches.values() {
            batch.batch_timer.cancel();
        }
        for set in state.staged.values() {
            if let Some(timer) = &set.cleanup_timer {
                timer.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::testing::{ChatEvent, FakeMedia, RecordingChat, image, message, video};
    use std::time::Duration;

    struct Fixture {
        batcher: UploadBatcher,
        store: Arc<MemoryObjectStore>,
        media: Arc<FakeMedia>,
        chat: Arc<RecordingChat>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new("https://cdn.example"));
        let chat = Arc::new(RecordingChat::default());
        let media = Arc::new(FakeMedia::default());
        let config = BatchConfig {
            max_images: 3,
            duplicate_window: Duration::from_secs(600),
            ..BatchConfig::default()
        };
        let batcher = UploadBatcher::new(
            config,
            store.clone(),
            media.clone(),
            chat.clone(),
        );
        Fixture {
            batcher,
            store,
            media,
            chat,
        }
    }

    fn batch_ids(outcome: UploadOutcome) -> Vec<u64> {
        match outcome {
            UploadOutcome::Batched { batch_ids } => batch_ids,
            other => panic!("expected batched upload, got {other:?}"),
        }
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename("my photo (1).png"), "my_photo__1_.png");
        assert_eq!(sanitize_filename("../.."), "_");
        assert_eq!(sanitize_filename("..."), "upload");
        let long = format!("{}.png", "a".repeat(100));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".png"));
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_original_when_an_attachment_cannot_be_staged() {
        let f = fixture();
        f.media.fail_on("uploads.example/b.png");
        let upload = message("m1", "alice", "", vec![image("a.png"), image("b.png")]);

        let ids = batch_ids(f.batcher.handle_upload(&upload, "guild").await.expect("upload"));
        assert_eq!(ids, vec![1]);
        assert!(f.media.requests().contains(&"https://uploads.example/b.png".to_string()));
        assert_eq!(f.store.keys().len(), 1);

        let sends = f.chat.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].files.len(), 1);
        assert!(f.chat.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_original_when_a_staged_image_cannot_be_fetched_back() {
        let f = fixture();
        f.media.fail_on("-b.png");
        let upload = message("m1", "alice", "", vec![image("a.png"), image("b.png")]);

        batch_ids(f.batcher.handle_upload(&upload, "guild").await.expect("upload"));
        assert_eq!(f.store.keys().len(), 2);
        let cdn_fetches = f
            .media
            .requests()
            .iter()
            .filter(|url| url.starts_with("https://cdn.example/"))
            .count();
        assert_eq!(cdn_fetches, 2);

        let sends = f.chat.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].files.len(), 1);
        assert!(f.chat.deleted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stages_renders_and_deletes_original() {
        let f = fixture();
        let upload = message("m1", "alice", "sketches", vec![image("a.png"), image("b.png")]);

        let ids = batch_ids(f.batcher.handle_upload(&upload, "guild").await.expect("upload"));
        assert_eq!(ids, vec![1]);

        let batch = f.batcher.active_batch("guild", "alice").expect("active batch");
        assert_eq!(batch.images.len(), 2);
        assert_eq!(f.store.keys().len(), 2);

        let key = &batch.images[0].storage_key;
        assert!(key.starts_with("temp-uploads/"));
        assert!(key.contains("/1/"));
        assert!(key.ends_with("-a.png"));
        let tags = f.store.tags(key).expect("tags");
        assert_eq!(tags.get("lifecycle").map(String::as_str), Some("temporary"));
        assert_eq!(tags.get("batch").map(String::as_str), Some("1"));
        assert_eq!(f.store.metadata(key).map(|(_, acl)| acl), Some(Acl::PublicRead));

        let sends = f.chat.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].files.len(), 2);
        let card = &sends[0].cards[0];
        assert_eq!(card.description.as_deref(), Some("sketches"));
        assert_eq!(card.image_url.as_deref(), Some("attachment://0_a.png"));
        assert_eq!(card.author.as_ref().map(|a| a.name.as_str()), Some("User alice"));
        assert_eq!(f.chat.deleted(), vec!["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_starts_new_batch_and_rerenders_sealed_one() {
        let f = fixture();
        let first = message("m1", "alice", "", vec![image("a.png"), image("b.png")]);
        f.batcher.handle_upload(&first, "guild").await.expect("first upload");

        let second = message("m2", "alice", "", vec![image("c.png"), image("d.png")]);
        let ids = batch_ids(f.batcher.handle_upload(&second, "guild").await.expect("second upload"));
        assert_eq!(ids, vec![1, 2]);

        let sealed = f.batcher.batch(1).expect("sealed batch");
        assert_eq!(sealed.images.len(), 3);
        let overflow = f.batcher.active_batch("guild", "alice").expect("overflow batch");
        assert_eq!(overflow.id, 2);
        assert_eq!(overflow.images.len(), 1);
        assert!(overflow.images[0].storage_key.contains("/2/"));
        assert!(overflow.images[0].storage_key.ends_with("-d.png"));

        assert_eq!(f.batcher.staged_keys(1).len(), 3);
        assert_eq!(f.batcher.staged_keys(2).len(), 1);
        assert_eq!(f.store.keys().len(), 4);

        // sealed batch was reposted, its old message removed
        assert_eq!(f.chat.deleted(), vec!["m1", "bot-0", "m2"]);
        let sends = f.chat.sends();
        assert_eq!(sends.len(), 3);
        assert_eq!(sends[1].files.len(), 3);
        assert_eq!(sends[1].cards[0].footer.as_deref(), Some("3 images"));
        assert_eq!(sends[2].files.len(), 1);
        assert_eq!(
            f.batcher.batch(1).and_then(|b| b.posted_message).map(|m| m.message_id),
            Some("bot-1".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_only_removes_own_batch_objects() {
        let f = fixture();
        let first = message("m1", "alice", "", vec![image("a.png"), image("b.png"), image("c.png")]);
        f.batcher.handle_upload(&first, "guild").await.expect("first upload");

        tokio::time::sleep(Duration::from_secs(200)).await;
        let second = message("m2", "alice", "", vec![image("d.png")]);
        let ids = batch_ids(f.batcher.handle_upload(&second, "guild").await.expect("second upload"));
        assert_eq!(ids, vec![2]);
        let survivors = f.batcher.staged_keys(2);
        assert_eq!(f.store.keys().len(), 4);

        // batch window over, objects still staged
        tokio::time::sleep(Duration::from_secs(101)).await;
        assert!(f.batcher.batch(1).is_none());
        assert_eq!(f.store.keys().len(), 4);

        // first batch's cleanup at 900s, second's at 1100s
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(f.store.keys(), survivors);
        assert!(f.batcher.staged_keys(1).is_empty());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(f.store.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_filenames_dropped_only_without_open_batch() {
        let f = fixture();
        let first = message("m1", "alice", "", vec![image("a.png")]);
        f.batcher.handle_upload(&first, "guild").await.expect("first upload");

        let again = message("m2", "alice", "", vec![image("a.png")]);
        let ids = batch_ids(f.batcher.handle_upload(&again, "guild").await.expect("repeat in batch"));
        assert_eq!(ids, vec![1]);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(f.batcher.active_batch("guild", "alice").is_none());

        let late = message("m3", "alice", "", vec![image("a.png")]);
        assert_eq!(
            f.batcher.handle_upload(&late, "guild").await.expect("late repeat"),
            UploadOutcome::DuplicateDropped
        );

        let other_user = message("m4", "bob", "", vec![image("a.png")]);
        assert_eq!(
            batch_ids(f.batcher.handle_upload(&other_user, "guild").await.expect("other user")),
            vec![2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn video_uploads_get_reaction_only() {
        let f = fixture();
        let clip = message("m1", "alice", "", vec![video("clip.mp4")]);

        assert_eq!(
            f.batcher.handle_upload(&clip, "guild").await.expect("video upload"),
            UploadOutcome::VideoOnly
        );
        assert_eq!(
            f.chat.events(),
            vec![ChatEvent::React {
                message_id: "m1".to_string(),
                emoji: VIDEO_REACTION.to_string(),
            }]
        );
        assert!(f.store.keys().is_empty());
        assert!(f.batcher.active_batch("guild", "alice").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_channel_starts_new_batch() {
        let f = fixture();
        let first = message("m1", "alice", "", vec![image("a.png")]);
        f.batcher.handle_upload(&first, "guild").await.expect("first upload");

        let mut elsewhere = message("m2", "alice", "", vec![image("b.png")]);
        elsewhere.channel_id = "other".to_string();
        let ids = batch_ids(f.batcher.handle_upload(&elsewhere, "guild").await.expect("second upload"));
        assert_eq!(ids, vec![2]);
        assert_eq!(
            f.batcher.active_batch("guild", "alice").map(|b| b.channel_id),
            Some("other".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_leaked_batches() {
        let f = fixture();
        let first = message("m1", "alice", "", vec![image("a.png")]);
        f.batcher.handle_upload(&first, "guild").await.expect("upload");

        // timers cancelled as if the process lost them
        f.batcher.shutdown();
        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(f.store.keys().len(), 1);

        assert_eq!(f.batcher.sweep().await, 1);
        assert!(f.store.keys().is_empty());
        assert!(f.batcher.batch(1).is_none());
    }
}
