//! Chat-platform boundary consumed by the pipeline

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::OutboundMessage;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
}

impl Attachment {
    fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    fn has_kind(&self, mime_prefix: &str, extensions: &[&str]) -> bool {
        match &self.content_type {
            Some(content_type) => content_type.starts_with(mime_prefix),
            None => self
                .extension()
                .is_some_and(|ext| extensions.contains(&ext.as_str())),
        }
    }

    pub fn is_image(&self) -> bool {
        self.has_kind("image/", IMAGE_EXTENSIONS)
    }

    pub fn is_video(&self) -> bool {
        self.has_kind("video/", VIDEO_EXTENSIONS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAuthor {
    pub id: String,
    pub name: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub author: ChatAuthor,
    pub guild_id: Option<String>,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            channel_id: self.channel_id.clone(),
            message_id: self.id.clone(),
        }
    }

    pub fn has_media(&self) -> bool {
        self.attachments
            .iter()
            .any(|attachment| attachment.is_image() || attachment.is_video())
    }
}

/// Address of a message already posted on the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn reply(&self, to: &InboundMessage, message: OutboundMessage) -> Result<MessageRef>;

    async fn send(&self, channel_id: &str, message: OutboundMessage) -> Result<MessageRef>;

    async fn react(&self, target: &MessageRef, emoji: &str) -> Result<()>;

    async fn delete_message(&self, target: &MessageRef) -> Result<()>;

    /// Hide the platform's own link previews on `target`
    async fn suppress_previews(&self, target: &MessageRef) -> Result<()>;

    async fn edit_message(&self, target: &MessageRef, content: &str) -> Result<()>;

    /// Permalink to a message
    fn message_link(&self, guild_id: &str, target: &MessageRef) -> String;

    /// How a member is referred to in bot text
    fn mention(&self, user_id: &str) -> String {
        user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(filename: &str, content_type: Option<&str>) -> Attachment {
        Attachment {
            url: format!("https://cdn.example/{filename}"),
            filename: filename.to_string(),
            content_type: content_type.map(ToString::to_string),
            size: 10,
        }
    }

    #[test]
    fn classifies_by_content_type_then_extension() {
        assert!(attachment("a.bin", Some("image/png")).is_image());
        assert!(attachment("clip.MP4", None).is_video());
        assert!(attachment("photo.jpeg", None).is_image());
        assert!(!attachment("notes.txt", None).is_image());
        assert!(!attachment("notes.txt", Some("text/plain")).is_video());
    }
}
