use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chat::{ChatPlatform, InboundMessage, MessageRef};
use crate::config::PipelineConfig;
use crate::ledger::{ArtworkShare, DuplicateInfo, VoteLedger, VoteOutcome, artwork_id};
use crate::matcher::{MatchedUrl, UrlMatcher, contains_url};
use crate::media::{Download, MediaSource};
use crate::models::{CardAuthor, EmbedData, OutboundFile, OutboundMessage, PreviewCard};
use crate::resilience::{BoundedCache, CircuitBreaker, EmbedCache, RateLimitDecision, RateLimiter};
use crate::uploads::{UploadBatcher, UploadOutcome};

/// Why a message was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BotAuthor,
    DirectMessage,
    ChannelNotAllowed,
    NoContent,
    EditWindowElapsed,
    /// Edit of a message whose earlier links are unknown
    PriorContentUnknown,
    NoNewUrls,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Ignored(SkipReason),
    RateLimited(RateLimitDecision),
    Uploaded(UploadOutcome),
    UploadFailed,
    Duplicate(DuplicateInfo),
    Replied {
        cards: usize,
        files: usize,
        links: usize,
    },
    /// An earlier rewrite-only reply was extended with new links
    Edited,
    /// Nothing resolved; mirror links were posted instead
    FallbackNotice,
    NothingResolved,
    SendFailed,
}

#[derive(Default)]
pub struct PipelineStats {
    messages_seen: AtomicU64,
    messages_enhanced: AtomicU64,
    urls_resolved: AtomicU64,
    urls_failed: AtomicU64,
    urls_dropped: AtomicU64,
    cache_hits: AtomicU64,
    negative_hits: AtomicU64,
    breaker_skips: AtomicU64,
    rate_limited: AtomicU64,
    duplicates: AtomicU64,
    uploads: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_seen: u64,
    pub messages_enhanced: u64,
    pub urls_resolved: u64,
    pub urls_failed: u64,
    pub urls_dropped: u64,
    pub cache_hits: u64,
    pub negative_hits: u64,
    pub breaker_skips: u64,
    pub rate_limited: u64,
    pub duplicates: u64,
    pub uploads: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_seen: load(&self.messages_seen),
            messages_enhanced: load(&self.messages_enhanced),
            urls_resolved: load(&self.urls_resolved),
            urls_failed: load(&self.urls_failed),
            urls_dropped: load(&self.urls_dropped),
            cache_hits: load(&self.cache_hits),
            negative_hits: load(&self.negative_hits),
            breaker_skips: load(&self.breaker_skips),
            rate_limited: load(&self.rate_limited),
            duplicates: load(&self.duplicates),
            uploads: load(&self.uploads),
        }
    }
}

/// Shared pipeline components, each usable on its own
pub struct Components {
    pub cache: Arc<EmbedCache>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub ledger: Arc<VoteLedger>,
    pub batcher: Arc<UploadBatcher>,
}

/// Reply posted for a message, kept for edits
#[derive(Debug, Clone)]
struct TrackedReply {
    target: MessageRef,
    content: Option<String>,
    rewrite_only: bool,
}

struct Reply {
    message: OutboundMessage,
    rewrite_only: bool,
}

pub struct EmbedEnhancer {
    config: PipelineConfig,
    matcher: UrlMatcher,
    components: Components,
    media: Arc<dyn MediaSource>,
    chat: Arc<dyn ChatPlatform>,
    replies: Mutex<BoundedCache<TrackedReply>>,
    /// Canonical URLs already handled per message, for diffing edits
    handled_urls: Mutex<BoundedCache<HashSet<String>>>,
    stats: PipelineStats,
}

const MAX_TRACKED_REPLIES: usize = 1000;
const MAX_TRACKED_MESSAGES: usize = 10_000;

fn minutes_ago(minutes: i64) -> String {
    match minutes {
        0 => "less than a minute ago".to_string(),
        1 => "1 minute ago".to_string(),
        n => format!("{n} minutes ago"),
    }
}

impl EmbedEnhancer {
    pub fn new(
        config: PipelineConfig,
        matcher: UrlMatcher,
        components: Components,
        media: Arc<dyn MediaSource>,
        chat: Arc<dyn ChatPlatform>,
    ) -> Self {
        let replies = BoundedCache::new(config.edit_window, MAX_TRACKED_REPLIES);
        let handled_urls = BoundedCache::new(config.edit_window, MAX_TRACKED_MESSAGES);
        Self {
            config,
            matcher,
            components,
            media,
            chat,
            replies: Mutex::new(replies),
            handled_urls: Mutex::new(handled_urls),
            stats: PipelineStats::default(),
        }
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Record or retract a member's vote on a shared artwork
    pub async fn toggle_vote(
        &self,
        artwork_id: &str,
        guild_id: &str,
        user_id: &str,
    ) -> Result<VoteOutcome> {
        self.components
            .ledger
            .toggle_vote(artwork_id, guild_id, user_id, Utc::now())
            .await
    }

    fn channel_allowed(&self, message: &InboundMessage) -> bool {
        let allowed = &self.config.allowed_channels;
        allowed.is_empty()
            || allowed.iter().any(|entry| {
                *entry == message.channel_id || message.channel_name.as_deref() == Some(entry.as_str())
            })
    }

    /// Fast-path filters shared by new and edited messages
    fn accept<'a>(&self, message: &'a InboundMessage) -> Result<&'a str, SkipReason> {
        if message.author.is_bot {
            return Err(SkipReason::BotAuthor);
        }
        let Some(guild_id) = message.guild_id.as_deref() else {
            return Err(SkipReason::DirectMessage);
        };
        if !self.channel_allowed(message) {
            return Err(SkipReason::ChannelNotAllowed);
        }
        Ok(guild_id)
    }

    pub async fn process_message(&self, message: &InboundMessage) -> ProcessOutcome {
        bump(&self.stats.messages_seen);
        let guild_id = match self.accept(message) {
            Ok(guild_id) => guild_id,
            Err(reason) => return ProcessOutcome::Ignored(reason),
        };

        if !contains_url(&message.content) {
            self.remember_urls(message, HashSet::new());
            if !message.has_media() {
                return ProcessOutcome::Ignored(SkipReason::NoContent);
            }
            return self.process_upload(message, guild_id).await;
        }

        let matches = self.matcher.match_all(&message.content);
        self.remember_urls(message, matches.iter().map(|m| m.canonical.clone()).collect());

        if let Some(limited) = self.rate_limit(message, guild_id) {
            return limited;
        }
        self.process_urls(message, guild_id, matches, None).await
    }

    fn remember_urls(&self, message: &InboundMessage, urls: HashSet<String>) {
        self.handled_urls.lock().insert(message.id.clone(), urls);
    }

    /// Handle URLs newly added by an edit of a recent message
    pub async fn process_message_edit(
        &self,
        previous_content: Option<&str>,
        message: &InboundMessage,
    ) -> ProcessOutcome {
        let guild_id = match self.accept(message) {
            Ok(guild_id) => guild_id,
            Err(reason) => return ProcessOutcome::Ignored(reason),
        };

        let window = TimeDelta::from_std(self.config.edit_window).unwrap_or(TimeDelta::MAX);
        if Utc::now().signed_duration_since(message.created_at) > window {
            return ProcessOutcome::Ignored(SkipReason::EditWindowElapsed);
        }

        let remembered = self.handled_urls.lock().get(&message.id);
        let known = match (previous_content, remembered) {
            (None, None) => None,
            (previous, remembered) => {
                let mut urls = remembered.unwrap_or_default();
                if let Some(previous) = previous {
                    urls.extend(self.matcher.canonical_urls(previous));
                }
                Some(urls)
            }
        };
        let Some(mut handled) = known else {
            debug!(message = %message.id, "edit of unknown message, skipping");
            return ProcessOutcome::Ignored(SkipReason::PriorContentUnknown);
        };

        let added: Vec<MatchedUrl> = self
            .matcher
            .match_all(&message.content)
            .into_iter()
            .filter(|matched| !handled.contains(&matched.canonical))
            .collect();
        if added.is_empty() {
            return ProcessOutcome::Ignored(SkipReason::NoNewUrls);
        }
        handled.extend(added.iter().map(|matched| matched.canonical.clone()));
        self.remember_urls(message, handled);

        if let Some(limited) = self.rate_limit(message, guild_id) {
            return limited;
        }

        let prior = self.replies.lock().get(&message.id);
        debug!(message = %message.id, added = added.len(), "processing edited message");
        self.process_urls(message, guild_id, added, prior).await
    }

    fn rate_limit(&self, message: &InboundMessage, guild_id: &str) -> Option<ProcessOutcome> {
        let decision = self.components.limiter.check(guild_id, &message.author.id);
        if decision.is_allowed() {
            return None;
        }
        bump(&self.stats.rate_limited);
        info!(guild = %guild_id, user = %message.author.id, ?decision, "rate limited");
        Some(ProcessOutcome::RateLimited(decision))
    }

    async fn process_upload(&self, message: &InboundMessage, guild_id: &str) -> ProcessOutcome {
        match self.components.batcher.handle_upload(message, guild_id).await {
            Ok(outcome) => {
                bump(&self.stats.uploads);
                ProcessOutcome::Uploaded(outcome)
            }
            Err(e) => {
                warn!(guild = %guild_id, message = %message.id, error = %e, "upload handling failed");
                ProcessOutcome::UploadFailed
            }
        }
    }

    async fn process_urls(
        &self,
        message: &InboundMessage,
        guild_id: &str,
        mut matches: Vec<MatchedUrl>,
        prior: Option<TrackedReply>,
    ) -> ProcessOutcome {
        if matches.len() > self.config.max_urls_per_message {
            let dropped = matches.len() - self.config.max_urls_per_message;
            self.stats.urls_dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(guild = %guild_id, dropped, "dropping URLs over the per-message cap");
            matches.truncate(self.config.max_urls_per_message);
        }
        let Some((first, rest)) = matches.split_first() else {
            return ProcessOutcome::NothingResolved;
        };

        let first_resolved = self.resolve(first, guild_id).await;
        let first_ok = first_resolved.is_some();
        if let Some(data) = &first_resolved
            && let Some(duplicate) = self.find_duplicate(data, message, guild_id).await
        {
            return self.send_duplicate_notice(message, guild_id, duplicate).await;
        }

        let mut results = vec![first_resolved];
        results.extend(join_all(rest.iter().map(|matched| self.resolve(matched, guild_id))).await);

        // the first URL failed; the check moves to the first one that resolved
        if !first_ok
            && let Some(data) = results.iter().flatten().next()
            && let Some(duplicate) = self.find_duplicate(data, message, guild_id).await
        {
            return self.send_duplicate_notice(message, guild_id, duplicate).await;
        }

        let mut resolved = Vec::with_capacity(matches.len());
        let mut failed = Vec::new();
        for (matched, result) in matches.iter().zip(results) {
            match result {
                Some(data) => resolved.push(data),
                None => failed.push(matched),
            }
        }

        if resolved.is_empty() {
            return self.send_fallback(message, guild_id, &failed).await;
        }

        let reply = self.build_reply(&resolved).await;
        if reply.message.is_empty() {
            return ProcessOutcome::NothingResolved;
        }
        let counts = (
            reply.message.cards.len(),
            reply.message.files.len(),
            reply
                .message
                .content
                .as_deref()
                .map_or(0, |content| content.lines().count()),
        );

        let outcome = match prior {
            Some(prior) if prior.rewrite_only && reply.rewrite_only => {
                self.extend_reply(message, guild_id, prior, reply).await
            }
            _ => self.send_reply(message, guild_id, reply, counts).await,
        };
        if matches!(outcome, ProcessOutcome::SendFailed) {
            return outcome;
        }

        self.suppress_previews(message, guild_id).await;
        self.record_shares(message, guild_id, &resolved).await;
        bump(&self.stats.messages_enhanced);
        outcome
    }

    /// Breaker gate, cache, then the handler
    async fn resolve(&self, matched: &MatchedUrl, guild_id: &str) -> Option<EmbedData> {
        let platform = matched.platform;
        let url = matched.url.as_str();

        if self.components.breaker.is_open(platform) {
            bump(&self.stats.breaker_skips);
            debug!(%platform, %url, "circuit open, skipping fetch");
            return None;
        }

        let key = EmbedData::cache_key(platform, &matched.canonical);
        if self.components.cache.is_negatively_cached(&key) {
            debug!(%platform, %url, "negatively cached");
            bump(&self.stats.negative_hits);
            bump(&self.stats.urls_failed);
            return None;
        }
        if let Some(hit) = self.components.cache.get(&key) {
            bump(&self.stats.cache_hits);
            bump(&self.stats.urls_resolved);
            return Some(hit);
        }

        let fetch = matched.handler.fetch_embed(&matched.groups, url);
        let result = match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(Ok(Some(data))) => {
                self.components.breaker.record_success(platform);
                self.components.cache.set(&key, data.clone());
                Some(data)
            }
            Ok(Ok(None)) => {
                debug!(%platform, %url, guild = %guild_id, "nothing embeddable");
                self.components.cache.set_negative(&key);
                None
            }
            Ok(Err(e)) => {
                warn!(%platform, %url, guild = %guild_id, error = %e, "fetch failed");
                self.components.breaker.record_failure(platform);
                self.components.cache.set_negative(&key);
                None
            }
            Err(_) => {
                warn!(%platform, %url, guild = %guild_id, "fetch timed out");
                self.components.breaker.record_failure(platform);
                self.components.cache.set_negative(&key);
                None
            }
        };

        bump(if result.is_some() {
            &self.stats.urls_resolved
        } else {
            &self.stats.urls_failed
        });
        result
    }

    /// Earlier share of the same artwork in this guild by another message
    async fn find_duplicate(
        &self,
        data: &EmbedData,
        message: &InboundMessage,
        guild_id: &str,
    ) -> Option<DuplicateInfo> {
        let id = artwork_id(data.platform, &data.original_url);
        match self
            .components
            .ledger
            .check_duplicate(&id, guild_id, self.config.duplicate_window, Utc::now())
            .await
        {
            Ok(duplicate) => duplicate.filter(|original| original.message_id != message.id),
            Err(e) => {
                warn!(artwork = %id, guild = %guild_id, error = %e, "duplicate check failed");
                None
            }
        }
    }

    async fn send_duplicate_notice(
        &self,
        message: &InboundMessage,
        guild_id: &str,
        duplicate: DuplicateInfo,
    ) -> ProcessOutcome {
        bump(&self.stats.duplicates);
        let original = MessageRef {
            channel_id: duplicate.channel_id.clone(),
            message_id: duplicate.message_id.clone(),
        };
        let notice = format!(
            "This artwork was already shared {} by {}. Jump to original: {}",
            minutes_ago(duplicate.minutes_ago),
            self.chat.mention(&duplicate.shared_by),
            self.chat.message_link(guild_id, &original)
        );
        info!(guild = %guild_id, original = %duplicate.message_id, "repost detected");

        if let Err(e) = self.chat.reply(message, OutboundMessage::text(notice)).await {
            warn!(guild = %guild_id, error = %e, "failed to send duplicate notice");
        }
        ProcessOutcome::Duplicate(duplicate)
    }

    async fn send_fallback(
        &self,
        message: &InboundMessage,
        guild_id: &str,
        failed: &[&MatchedUrl],
    ) -> ProcessOutcome {
        let links: Vec<String> = failed
            .iter()
            .filter_map(|matched| matched.handler.fixup_url(&matched.groups))
            .collect();
        if links.is_empty() {
            return ProcessOutcome::NothingResolved;
        }

        let notice = format!("Couldn't load a preview, try:\n{}", links.join("\n"));
        match self.chat.reply(message, OutboundMessage::text(notice)).await {
            Ok(_) => ProcessOutcome::FallbackNotice,
            Err(e) => {
                warn!(guild = %guild_id, error = %e, "failed to send fallback notice");
                ProcessOutcome::SendFailed
            }
        }
    }

    fn card(data: &EmbedData, image_url: Option<String>, with_metadata: bool) -> PreviewCard {
        if !with_metadata {
            // same url groups the images under the first card
            return PreviewCard {
                url: Some(data.original_url.clone()),
                image_url,
                ..PreviewCard::default()
            };
        }

        let author = &data.author;
        let name = if author.username.is_empty() {
            author.name.clone()
        } else {
            format!("{} (@{})", author.name, author.username)
        };
        PreviewCard {
            title: None,
            description: data.text.clone().filter(|text| !text.is_empty()),
            url: Some(data.original_url.clone()),
            color: Some(data.color),
            timestamp: data.timestamp,
            author: Some(CardAuthor {
                name,
                url: Some(author.url.clone()),
                icon_url: author.icon_url.clone(),
            }),
            image_url,
            footer: Some(data.platform.to_string()),
        }
    }

    async fn build_reply(&self, resolved: &[EmbedData]) -> Reply {
        let max_cards = self.config.max_cards_per_message;
        let mut links = Vec::new();
        let mut cards = Vec::new();
        let mut files = Vec::new();

        for data in resolved {
            if data.use_url_rewrite {
                if let Some(url) = &data.rewritten_url {
                    links.push(url.clone());
                }
                continue;
            }

            if let Some(video) = data.videos.first() {
                match self
                    .media
                    .download(video.best_url(), Some(self.config.max_video_bytes))
                    .await
                {
                    Ok(Download::Complete { data: bytes, .. }) => {
                        let prefix = if data.is_nsfw { "SPOILER_" } else { "" };
                        files.push(OutboundFile {
                            filename: format!("{prefix}{}_{}.mp4", data.platform, files.len()),
                            data: bytes,
                        });
                        if cards.len() < max_cards {
                            cards.push(Self::card(data, None, true));
                        }
                    }
                    Ok(Download::TooLarge) => {
                        info!(url = %data.original_url, "video over size ceiling, linking mirror");
                        links.push(data.rewritten_url.clone().unwrap_or_else(|| data.original_url.clone()));
                    }
                    Err(e) => {
                        warn!(url = %data.original_url, error = %e, "video download failed, linking mirror");
                        links.push(data.rewritten_url.clone().unwrap_or_else(|| data.original_url.clone()));
                    }
                }
                continue;
            }

            if data.images.is_empty() {
                if cards.len() < max_cards {
                    cards.push(Self::card(data, None, true));
                }
                continue;
            }

            for (index, image) in data.images.iter().enumerate() {
                if cards.len() >= max_cards {
                    break;
                }
                cards.push(Self::card(data, Some(image.clone()), index == 0));
            }
        }

        let rewrite_only = cards.is_empty() && files.is_empty();
        Reply {
            message: OutboundMessage {
                content: (!links.is_empty()).then(|| links.join("\n")),
                cards,
                files,
            },
            rewrite_only,
        }
    }

    async fn send_reply(
        &self,
        message: &InboundMessage,
        guild_id: &str,
        reply: Reply,
        (cards, files, links): (usize, usize, usize),
    ) -> ProcessOutcome {
        let content = reply.message.content.clone();
        match self.chat.reply(message, reply.message).await {
            Ok(target) => {
                self.replies.lock().insert(
                    message.id.clone(),
                    TrackedReply {
                        target,
                        content,
                        rewrite_only: reply.rewrite_only,
                    },
                );
                ProcessOutcome::Replied { cards, files, links }
            }
            Err(e) => {
                warn!(guild = %guild_id, message = %message.id, error = %e, "failed to send reply");
                ProcessOutcome::SendFailed
            }
        }
    }

    async fn extend_reply(
        &self,
        message: &InboundMessage,
        guild_id: &str,
        prior: TrackedReply,
        reply: Reply,
    ) -> ProcessOutcome {
        let content = [prior.content, reply.message.content]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("\n");
        match self.chat.edit_message(&prior.target, &content).await {
            Ok(()) => {
                self.replies.lock().insert(
                    message.id.clone(),
                    TrackedReply {
                        target: prior.target,
                        content: Some(content),
                        rewrite_only: true,
                    },
                );
                ProcessOutcome::Edited
            }
            Err(e) => {
                warn!(guild = %guild_id, error = %e, "failed to edit reply");
                ProcessOutcome::SendFailed
            }
        }
    }

    /// Hide the platform's own previews now and again after they render late
    async fn suppress_previews(&self, message: &InboundMessage, guild_id: &str) {
        let target = message.message_ref();
        if let Err(e) = self.chat.suppress_previews(&target).await {
            debug!(guild = %guild_id, error = %e, "failed to suppress previews");
        }

        let chat = Arc::clone(&self.chat);
        let delay = self.config.resuppress_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = chat.suppress_previews(&target).await {
                debug!(message = %target.message_id, error = %e, "failed to re-suppress previews");
            }
        });
    }

    async fn record_shares(&self, message: &InboundMessage, guild_id: &str, resolved: &[EmbedData]) {
        let now = Utc::now();
        for data in resolved {
            let share = ArtworkShare {
                artwork_id: artwork_id(data.platform, &data.original_url),
                original_url: data.original_url.clone(),
                platform: data.platform,
                artist_username: data.author.username.clone(),
                artist_name: data.author.name.clone(),
                guild_id: guild_id.to_string(),
                shared_by: message.author.id.clone(),
                message_id: message.id.clone(),
                channel_id: message.channel_id.clone(),
            };
            if let Err(e) = self.components.ledger.record_artwork(share, now).await {
                warn!(url = %data.original_url, guild = %guild_id, error = %e, "failed to record artwork");
            }
        }
    }
}
