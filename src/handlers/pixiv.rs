//! Pixiv handler: rewrites artwork links to a preview-rendering proxy

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::error::FetchError;
use crate::models::{EmbedAuthor, EmbedData, Platform};
use crate::traits::{MatchGroups, PlatformHandler};

pub const FIXUP_HOST: &str = "www.phixiv.net";

pub struct PixivHandler {
    patterns: Vec<Regex>,
}

impl PixivHandler {
    pub fn new() -> Result<Self> {
        let patterns = vec![
            Regex::new(
                r"^https?://(?:www\.)?(?:pixiv\.net|phixiv\.net|ppxiv\.net)/(?:[a-z]{2}/)?artworks/(?P<id>\d+)",
            )?,
            Regex::new(
                r"^https?://(?:www\.)?(?:pixiv\.net|phixiv\.net)/member_illust\.php\?(?:[^\s#]*&)?illust_id=(?P<id>\d+)",
            )?,
        ];
        Ok(Self { patterns })
    }
}

#[async_trait]
impl PlatformHandler for PixivHandler {
    fn platform(&self) -> Platform {
        Platform::Pixiv
    }

    fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn canonical_url(&self, groups: &MatchGroups) -> Option<String> {
        let id = groups.get("id")?;
        Some(format!("https://www.pixiv.net/artworks/{id}"))
    }

    fn fixup_url(&self, groups: &MatchGroups) -> Option<String> {
        let id = groups.get("id")?;
        Some(format!("https://{FIXUP_HOST}/artworks/{id}"))
    }

    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        _url: &str,
    ) -> Result<Option<EmbedData>, FetchError> {
        let Some(original_url) = self.canonical_url(groups) else {
            return Ok(None);
        };

        Ok(Some(EmbedData {
            platform: Platform::Pixiv,
            author: EmbedAuthor {
                name: "pixiv".to_string(),
                username: String::new(),
                url: "https://www.pixiv.net".to_string(),
                icon_url: None,
            },
            text: None,
            images: Vec::new(),
            videos: Vec::new(),
            color: Platform::Pixiv.color(),
            original_url,
            timestamp: None,
            is_nsfw: false,
            use_url_rewrite: true,
            rewritten_url: self.fixup_url(groups),
        }))
    }
}
