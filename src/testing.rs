//! Test doubles for the pipeline's external boundaries

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;

use crate::chat::{Attachment, ChatAuthor, ChatPlatform, InboundMessage, MessageRef};
use crate::error::FetchError;
use crate::media::{Download, MediaSource};
use crate::models::{EmbedAuthor, EmbedData, OutboundMessage, Platform};
use crate::traits::{MatchGroups, PlatformHandler};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Reply { to: String, message: OutboundMessage },
    Send { channel_id: String, message: OutboundMessage },
    React { message_id: String, emoji: String },
    Delete { message_id: String },
    Suppress { message_id: String },
    Edit { message_id: String, content: String },
}

#[derive(Default)]
pub struct RecordingChat {
    next_id: AtomicU64,
    events: Mutex<Vec<ChatEvent>>,
}

impl RecordingChat {
    pub fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().clone()
    }

    pub fn replies(&self) -> Vec<OutboundMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChatEvent::Reply { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn sends(&self) -> Vec<OutboundMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChatEvent::Send { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ChatEvent::Delete { message_id } => Some(message_id),
                _ => None,
            })
            .collect()
    }

    fn posted(&self, channel_id: &str) -> MessageRef {
        MessageRef {
            channel_id: channel_id.to_string(),
            message_id: format!("bot-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        }
    }
}

#[async_trait]
impl ChatPlatform for RecordingChat {
    async fn reply(&self, to: &InboundMessage, message: OutboundMessage) -> Result<MessageRef> {
        self.events.lock().push(ChatEvent::Reply {
            to: to.id.clone(),
            message,
        });
        Ok(self.posted(&to.channel_id))
    }

    async fn send(&self, channel_id: &str, message: OutboundMessage) -> Result<MessageRef> {
        self.events.lock().push(ChatEvent::Send {
            channel_id: channel_id.to_string(),
            message,
        });
        Ok(self.posted(channel_id))
    }

    async fn react(&self, target: &MessageRef, emoji: &str) -> Result<()> {
        self.events.lock().push(ChatEvent::React {
            message_id: target.message_id.clone(),
            emoji: emoji.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, target: &MessageRef) -> Result<()> {
        self.events.lock().push(ChatEvent::Delete {
            message_id: target.message_id.clone(),
        });
        Ok(())
    }

    async fn suppress_previews(&self, target: &MessageRef) -> Result<()> {
        self.events.lock().push(ChatEvent::Suppress {
            message_id: target.message_id.clone(),
        });
        Ok(())
    }

    async fn edit_message(&self, target: &MessageRef, content: &str) -> Result<()> {
        self.events.lock().push(ChatEvent::Edit {
            message_id: target.message_id.clone(),
            content: content.to_string(),
        });
        Ok(())
    }

    fn message_link(&self, guild_id: &str, target: &MessageRef) -> String {
        format!(
            "https://chat.example/{guild_id}/{}/{}",
            target.channel_id, target.message_id
        )
    }
}

/// Serves deterministic bytes for any URL; optional per-URL sizes and failures
#[derive(Default)]
pub struct FakeMedia {
    sizes: Mutex<HashMap<String, usize>>,
    failing: Mutex<Vec<String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeMedia {
    pub fn with_size(&self, url: &str, size: usize) {
        self.sizes.lock().insert(url.to_string(), size);
    }

    /// Fail every download whose URL ends with `suffix`
    pub fn fail_on(&self, suffix: &str) {
        self.failing.lock().push(suffix.to_string());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn download(&self, url: &str, max_bytes: Option<u64>) -> Result<Download> {
        self.requests.lock().push(url.to_string());
        if self.failing.lock().iter().any(|suffix| url.ends_with(suffix.as_str())) {
            anyhow::bail!("download failed: {url}");
        }
        let size = self.sizes.lock().get(url).copied().unwrap_or(4);
        if max_bytes.is_some_and(|limit| size as u64 > limit) {
            return Ok(Download::TooLarge);
        }
        Ok(Download::Complete {
            data: vec![7; size],
            content_type: Some("image/png".to_string()),
        })
    }
}

/// Behaviour of a [`StaticHandler`] fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchBehaviour {
    Resolve,
    NotFound,
    Fail,
}

/// Handler for `https://<host>/<user>/status/<id>` and its
/// `mirror.<host>` twin, with scripted results
pub struct StaticHandler {
    platform: Platform,
    host: String,
    patterns: Vec<Regex>,
    behaviour: Mutex<FetchBehaviour>,
    pub calls: AtomicUsize,
    pub video_url: Mutex<Option<String>>,
    /// Resolve as a rewrite-only preview
    pub rewrite_only: AtomicBool,
}

impl StaticHandler {
    pub fn new(platform: Platform, host: &str) -> Self {
        let pattern = format!(
            r"^https?://(?:mirror\.)?{}/(?P<user>\w+)/status/(?P<id>\d+)",
            regex::escape(host)
        );
        Self {
            platform,
            host: host.to_string(),
            patterns: vec![Regex::new(&pattern).expect("test pattern")],
            behaviour: Mutex::new(FetchBehaviour::Resolve),
            calls: AtomicUsize::new(0),
            video_url: Mutex::new(None),
            rewrite_only: AtomicBool::new(false),
        }
    }

    pub fn set_behaviour(&self, behaviour: FetchBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformHandler for StaticHandler {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn canonical_url(&self, groups: &MatchGroups) -> Option<String> {
        Some(format!(
            "https://{}/{}/status/{}",
            self.host,
            groups.get("user")?,
            groups.get("id")?
        ))
    }

    fn fixup_url(&self, groups: &MatchGroups) -> Option<String> {
        Some(format!(
            "https://fixup.example/{}/status/{}",
            groups.get("user")?,
            groups.get("id")?
        ))
    }

    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        _url: &str,
    ) -> Result<Option<EmbedData>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behaviour = *self.behaviour.lock();
        match behaviour {
            FetchBehaviour::NotFound => return Ok(None),
            FetchBehaviour::Fail => return Err(FetchError::Status(503)),
            FetchBehaviour::Resolve => {}
        }

        let user = groups.get("user").cloned().unwrap_or_default();
        let id = groups.get("id").cloned().unwrap_or_default();
        let videos = self
            .video_url
            .lock()
            .clone()
            .map(|video| {
                vec![crate::models::VideoData {
                    url: video,
                    thumbnail: None,
                    variants: Vec::new(),
                    kind: Some("video".to_string()),
                }]
            })
            .unwrap_or_default();
        let rewrite_only = self.rewrite_only.load(Ordering::SeqCst);
        let images = if videos.is_empty() && !rewrite_only {
            vec![format!("https://img.example/{id}.jpg")]
        } else {
            Vec::new()
        };

        Ok(Some(EmbedData {
            platform: self.platform,
            author: EmbedAuthor {
                name: user.to_uppercase(),
                username: user.clone(),
                url: format!("https://art.example/{user}"),
                icon_url: None,
            },
            text: Some(format!("post {id}")),
            images,
            videos,
            color: self.platform.color(),
            original_url: self.canonical_url(groups).unwrap_or_default(),
            timestamp: None,
            is_nsfw: false,
            use_url_rewrite: rewrite_only,
            rewritten_url: self.fixup_url(groups),
        }))
    }
}

pub fn author(id: &str) -> ChatAuthor {
    ChatAuthor {
        id: id.to_string(),
        name: format!("User {id}"),
        username: id.to_string(),
        avatar_url: None,
        is_bot: false,
    }
}

pub fn message(id: &str, user: &str, content: &str, attachments: Vec<Attachment>) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        content: content.to_string(),
        attachments,
        author: author(user),
        guild_id: Some("guild".to_string()),
        channel_id: "channel".to_string(),
        channel_name: Some("art".to_string()),
        created_at: Utc::now(),
    }
}

pub fn image(filename: &str) -> Attachment {
    Attachment {
        url: format!("https://uploads.example/{filename}"),
        filename: filename.to_string(),
        content_type: Some("image/png".to_string()),
        size: 4,
    }
}

pub fn video(filename: &str) -> Attachment {
    Attachment {
        url: format!("https://uploads.example/{filename}"),
        filename: filename.to_string(),
        content_type: Some("video/mp4".to_string()),
        size: 4,
    }
}
