//! Bluesky handler: rewrites post links to fxbsky

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::error::FetchError;
use crate::models::{EmbedAuthor, EmbedData, Platform};
use crate::traits::{MatchGroups, PlatformHandler};

pub const FIXUP_HOST: &str = "fxbsky.app";

pub struct BlueskyHandler {
    patterns: Vec<Regex>,
}

impl BlueskyHandler {
    pub fn new() -> Result<Self> {
        let patterns = vec![Regex::new(
            r"^https?://(?:www\.)?(?:bsky\.app|fxbsky\.app|vxbsky\.app|bskyx\.app)/profile/(?P<handle>[A-Za-z0-9.:_-]+)/post/(?P<id>[a-z0-9]+)",
        )?];
        Ok(Self { patterns })
    }
}

#[async_trait]
impl PlatformHandler for BlueskyHandler {
    fn platform(&self) -> Platform {
        Platform::Bluesky
    }

    fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn canonical_url(&self, groups: &MatchGroups) -> Option<String> {
        let (handle, id) = (groups.get("handle")?, groups.get("id")?);
        Some(format!("https://bsky.app/profile/{handle}/post/{id}"))
    }

    fn fixup_url(&self, groups: &MatchGroups) -> Option<String> {
        let (handle, id) = (groups.get("handle")?, groups.get("id")?);
        Some(format!("https://{FIXUP_HOST}/profile/{handle}/post/{id}"))
    }

    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        _url: &str,
    ) -> Result<Option<EmbedData>, FetchError> {
        let (Some(handle), Some(original_url)) = (groups.get("handle"), self.canonical_url(groups))
        else {
            return Ok(None);
        };

        let profile = format!("https://bsky.app/profile/{handle}");
        Ok(Some(EmbedData {
            platform: Platform::Bluesky,
            author: EmbedAuthor {
                name: handle.clone(),
                username: handle.clone(),
                url: profile.clone(),
                icon_url: None,
            },
            text: None,
            images: Vec::new(),
            videos: Vec::new(),
            color: Platform::Bluesky.color(),
            original_url,
            timestamp: None,
            is_nsfw: false,
            use_url_rewrite: true,
            rewritten_url: self.fixup_url(groups),
        }))
    }
}
