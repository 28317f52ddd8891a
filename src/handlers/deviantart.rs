//! DeviantArt handler: fetches the deviation page and reads its OpenGraph tags

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tracing::debug;

use crate::error::FetchError;
use crate::models::{EmbedAuthor, EmbedData, Platform};
use crate::traits::{MatchGroups, PlatformHandler};

/// Metadata pulled from a deviation page
#[derive(Debug, Default, PartialEq)]
struct PageMeta {
    title: Option<String>,
    description: Option<String>,
    image: Option<String>,
    mature: bool,
}

pub struct DeviantArtHandler {
    client: Client,
    timeout: Duration,
    patterns: Vec<Regex>,
}

impl DeviantArtHandler {
    pub fn new(timeout: Duration) -> Result<Self> {
        let patterns = vec![Regex::new(
            r"^https?://(?:www\.)?deviantart\.com/(?P<user>[A-Za-z0-9-]+)/art/(?P<slug>[A-Za-z0-9-]*?-?(?P<id>\d+))(?:[/?#]|$)",
        )?];

        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .build()?;

        Ok(Self {
            client,
            timeout,
            patterns,
        })
    }
}

fn meta_content(document: &Html, selector: &str) -> Result<Option<String>, FetchError> {
    let selector = Selector::parse(selector)
        .map_err(|e| FetchError::Decode(format!("Failed to parse selector {selector}: {e:?}")))?;

    Ok(document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty()))
}

/// Parse OpenGraph tags; `Html` is not `Send`, so this stays synchronous
fn parse_page(html: &str) -> Result<PageMeta, FetchError> {
    let document = Html::parse_document(html);

    Ok(PageMeta {
        title: meta_content(&document, r#"meta[property="og:title"]"#)?,
        description: meta_content(&document, r#"meta[property="og:description"]"#)?,
        image: meta_content(&document, r#"meta[property="og:image"]"#)?,
        mature: meta_content(&document, r#"meta[name="rating"]"#)?
            .is_some_and(|rating| rating.eq_ignore_ascii_case("adult")),
    })
}

#[async_trait]
impl PlatformHandler for DeviantArtHandler {
    fn platform(&self) -> Platform {
        Platform::DeviantArt
    }

    fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn canonical_url(&self, groups: &MatchGroups) -> Option<String> {
        let (user, slug) = (groups.get("user")?, groups.get("slug")?);
        Some(format!("https://www.deviantart.com/{user}/art/{slug}"))
    }

    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        _url: &str,
    ) -> Result<Option<EmbedData>, FetchError> {
        let (Some(user), Some(canonical)) = (groups.get("user"), self.canonical_url(groups)) else {
            return Ok(None);
        };

        let response = tokio::time::timeout(self.timeout, self.client.get(&canonical).send())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => return Ok(None),
            status if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            _ => {}
        }

        let html = tokio::time::timeout(self.timeout, response.text())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let meta = parse_page(&html)?;
        let Some(image) = meta.image else {
            debug!(url = %canonical, "deviation page has no og:image");
            return Ok(None);
        };

        Ok(Some(EmbedData {
            platform: Platform::DeviantArt,
            author: EmbedAuthor {
                name: user.clone(),
                username: user.clone(),
                url: format!("https://www.deviantart.com/{user}"),
                icon_url: None,
            },
            text: meta.title.or(meta.description),
            images: vec![image],
            videos: Vec::new(),
            color: Platform::DeviantArt.color(),
            original_url: canonical,
            timestamp: None,
            is_nsfw: meta.mature,
            use_url_rewrite: false,
            rewritten_url: None,
        }))
    }
}
