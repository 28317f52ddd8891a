//! Data models for resolved previews and outbound preview cards

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External platform a URL was recognised as belonging to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitter,
    Pixiv,
    Bluesky,
    DeviantArt,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twitter => "twitter",
            Self::Pixiv => "pixiv",
            Self::Bluesky => "bluesky",
            Self::DeviantArt => "deviantart",
        }
    }

    /// Brand colour used for preview cards
    pub fn color(self) -> u32 {
        match self {
            Self::Twitter => 0x001D_A1F2,
            Self::Pixiv => 0x0000_96FA,
            Self::Bluesky => 0x0000_85FF,
            Self::DeviantArt => 0x0005_CC47,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author block of a resolved post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    pub username: String,
    pub url: String,
    pub icon_url: Option<String>,
}

/// One quality rendition of a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoVariant {
    pub url: String,
    pub bitrate: Option<u64>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoData {
    pub url: String,
    pub thumbnail: Option<String>,
    /// Sorted by descending bitrate, container-filtered
    pub variants: Vec<VideoVariant>,
    /// `video` or `gif`
    pub kind: Option<String>,
}

impl VideoData {
    /// Best rendition available, falling back to the primary URL
    pub fn best_url(&self) -> &str {
        self.variants
            .first()
            .map_or(self.url.as_str(), |variant| variant.url.as_str())
    }
}

/// Canonical result of resolving one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedData {
    pub platform: Platform,
    pub author: EmbedAuthor,
    pub text: Option<String>,
    pub images: Vec<String>,
    pub videos: Vec<VideoData>,
    pub color: u32,
    /// Always on the canonical host, never a mirror
    pub original_url: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_nsfw: bool,
    pub use_url_rewrite: bool,
    pub rewritten_url: Option<String>,
}

impl EmbedData {
    /// Key used by the cache for this platform/url pair
    pub fn cache_key(platform: Platform, url: &str) -> String {
        format!("{platform}:{url}")
    }
}

/// Author line of a preview card
#[derive(Debug, Clone, PartialEq)]
pub struct CardAuthor {
    pub name: String,
    pub url: Option<String>,
    pub icon_url: Option<String>,
}

/// Rich preview block attached to an outbound chat message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PreviewCard {
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub color: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub author: Option<CardAuthor>,
    /// Remote URL or `attachment://<filename>`
    pub image_url: Option<String>,
    pub footer: Option<String>,
}

/// File uploaded alongside an outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Outbound chat message payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub content: Option<String>,
    pub cards: Vec<PreviewCard>,
    pub files: Vec<OutboundFile>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.as_deref().is_none_or(str::is_empty)
            && self.cards.is_empty()
            && self.files.is_empty()
    }
}
