//! Twitter/X handler backed by an fxtwitter-style JSON mirror API

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::models::{EmbedAuthor, EmbedData, Platform, VideoData, VideoVariant};
use crate::traits::{MatchGroups, PlatformHandler};

const VIDEO_CONTAINER: &str = "video/mp4";
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Host substituted for the canonical one when a rich preview must come from the chat platform
pub const FIXUP_HOST: &str = "fxtwitter.com";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: u16,
    tweet: Option<ApiTweet>,
}

#[derive(Debug, Deserialize)]
struct ApiTweet {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    created_timestamp: Option<i64>,
    author: ApiAuthor,
    #[serde(default)]
    possibly_sensitive: bool,
    #[serde(default)]
    media: Option<ApiMedia>,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    name: String,
    screen_name: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiMedia {
    #[serde(default)]
    photos: Vec<ApiPhoto>,
    #[serde(default)]
    videos: Vec<ApiVideo>,
}

#[derive(Debug, Deserialize)]
struct ApiPhoto {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiVideo {
    url: String,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    variants: Vec<ApiVariant>,
}

#[derive(Debug, Deserialize)]
struct ApiVariant {
    url: String,
    #[serde(default)]
    bitrate: Option<u64>,
    #[serde(default)]
    content_type: Option<String>,
}

/// Handler resolving tweets through the mirror API
pub struct TwitterHandler {
    client: Client,
    api_base: String,
    /// Whole fetch, retries and backoff included
    budget: Duration,
    attempt_timeout: Duration,
    patterns: Vec<Regex>,
}

/// Jittered exponential delay before retry number `attempt`
fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.pow(attempt.saturating_sub(1));
    let jitter = rand::rng().random_range(0..=base.as_millis() as u64);
    base + Duration::from_millis(jitter)
}

impl TwitterHandler {
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let patterns = vec![Regex::new(
            r"^https?://(?:www\.|mobile\.)?(?:twitter\.com|x\.com|fxtwitter\.com|vxtwitter\.com|fixupx\.com|fixvx\.com)/(?P<user>[A-Za-z0-9_]{1,15})/status(?:es)?/(?P<id>\d+)",
        )?];

        let client = Client::builder().build()?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            budget: timeout,
            attempt_timeout: timeout / MAX_ATTEMPTS,
            patterns,
        })
    }

    pub fn canonical_link(user: &str, id: &str) -> String {
        format!("https://x.com/{user}/status/{id}")
    }

    pub fn fixup_link(user: &str, id: &str) -> String {
        format!("https://{FIXUP_HOST}/{user}/status/{id}")
    }

    async fn request(&self, user: &str, id: &str) -> Result<Option<ApiTweet>, FetchError> {
        let url = format!(
            "{}/{}/status/{}",
            self.api_base,
            urlencoding::encode(user),
            urlencoding::encode(id)
        );

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Ok(None);
            }
            status if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            _ => {}
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        if body.code != 200 {
            debug!(code = body.code, %user, %id, "mirror API reported no tweet");
            return Ok(None);
        }

        Ok(body.tweet)
    }

    /// Whether a retry after `delay` still finishes inside the budget
    fn retry_fits(&self, started: Instant, delay: Duration) -> bool {
        started.elapsed() + delay + self.attempt_timeout <= self.budget
    }

    /// Retry retryable failures with jittered exponential backoff
    async fn request_with_retry(&self, user: &str, id: &str) -> Result<Option<ApiTweet>, FetchError> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.attempt_timeout, self.request(user, id))
                .await
                .unwrap_or(Err(FetchError::Timeout(self.attempt_timeout)));
            match result {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff(attempt);
                    if !self.retry_fits(started, delay) {
                        debug!(%user, %id, attempt, "fetch budget spent, not retrying");
                        return Err(e);
                    }
                    warn!(%user, %id, attempt, error = %e, ?delay, "retrying mirror API request");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

fn map_video(video: ApiVideo) -> VideoData {
    let mut variants: Vec<VideoVariant> = video
        .variants
        .into_iter()
        .filter_map(|variant| {
            let content_type = variant.content_type?;
            (content_type == VIDEO_CONTAINER).then_some(VideoVariant {
                url: variant.url,
                bitrate: variant.bitrate,
                content_type,
            })
        })
        .collect();
    variants.sort_by(|a, b| b.bitrate.unwrap_or(0).cmp(&a.bitrate.unwrap_or(0)));

    VideoData {
        url: video.url,
        thumbnail: video.thumbnail_url,
        variants,
        kind: video.kind,
    }
}

fn map_tweet(tweet: ApiTweet, user: &str, id: &str) -> Option<EmbedData> {
    let media = tweet.media.unwrap_or_default();
    let images: Vec<String> = media.photos.into_iter().map(|photo| photo.url).collect();
    let videos: Vec<VideoData> = media.videos.into_iter().map(map_video).collect();
    let text = tweet.text.filter(|text| !text.trim().is_empty());

    if images.is_empty() && videos.is_empty() && text.is_none() {
        return None;
    }

    let timestamp = tweet
        .created_timestamp
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Some(EmbedData {
        platform: Platform::Twitter,
        author: EmbedAuthor {
            url: format!("https://x.com/{}", tweet.author.screen_name),
            name: tweet.author.name,
            username: tweet.author.screen_name,
            icon_url: tweet.author.avatar_url,
        },
        text,
        images,
        videos,
        color: Platform::Twitter.color(),
        original_url: TwitterHandler::canonical_link(user, id),
        timestamp,
        is_nsfw: tweet.possibly_sensitive,
        use_url_rewrite: false,
        rewritten_url: Some(TwitterHandler::fixup_link(user, id)),
    })
}

#[async_trait]
impl PlatformHandler for TwitterHandler {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    fn canonical_url(&self, groups: &MatchGroups) -> Option<String> {
        Some(Self::canonical_link(groups.get("user")?, groups.get("id")?))
    }

    fn fixup_url(&self, groups: &MatchGroups) -> Option<String> {
        Some(Self::fixup_link(groups.get("user")?, groups.get("id")?))
    }

    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        url: &str,
    ) -> Result<Option<EmbedData>, FetchError> {
        let (Some(user), Some(id)) = (groups.get("user"), groups.get("id")) else {
            warn!(%url, "twitter match without user/id groups");
            return Ok(None);
        };

        let Some(tweet) = self.request_with_retry(user, id).await? else {
            return Ok(None);
        };

        Ok(map_tweet(tweet, user, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> TwitterHandler {
        TwitterHandler::new("https://api.example.test", Duration::from_secs(1))
            .expect("handler should build")
    }

    #[test]
    fn matches_canonical_and_mirror_hosts() {
        let handler = handler();
        for url in [
            "https://twitter.com/artist/status/123",
            "https://x.com/artist/status/123",
            "https://mobile.twitter.com/artist/status/123",
            "https://fxtwitter.com/artist/status/123",
            "https://vxtwitter.com/artist/status/123?s=20",
        ] {
            let groups = handler.match_url(url).expect("should match");
            assert_eq!(groups.get("user").map(String::as_str), Some("artist"));
            assert_eq!(groups.get("id").map(String::as_str), Some("123"));
        }
        assert!(handler.match_url("https://twitter.com/artist").is_none());
        assert!(handler.match_url("https://example.com/artist/status/1").is_none());
    }

    #[test]
    fn mirrors_and_query_strings_share_canonical_url() {
        let handler = handler();
        let canonical: Vec<_> = [
            "https://twitter.com/artist/status/123",
            "https://fxtwitter.com/artist/status/123",
            "https://x.com/artist/status/123?s=20",
        ]
        .into_iter()
        .map(|url| handler.canonical_url(&handler.match_url(url).expect("should match")))
        .collect();
        assert!(canonical
            .iter()
            .all(|url| url.as_deref() == Some("https://x.com/artist/status/123")));
    }

    #[test]
    fn attempts_share_the_fetch_budget() {
        let handler = TwitterHandler::new("https://api.example.test", Duration::from_secs(9))
            .expect("handler should build");
        assert_eq!(handler.attempt_timeout, Duration::from_secs(3));
        assert!(handler.attempt_timeout * MAX_ATTEMPTS <= handler.budget);

        for attempt in 1..MAX_ATTEMPTS {
            let base = BACKOFF_BASE * 2u32.pow(attempt - 1);
            let delay = backoff(attempt);
            assert!(delay >= base && delay <= base * 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_when_budget_is_spent() {
        let handler = TwitterHandler::new("https://api.example.test", Duration::from_secs(3))
            .expect("handler should build");
        let started = Instant::now();
        let delay = Duration::from_millis(250);
        assert!(handler.retry_fits(started, delay));

        // one timed-out attempt still leaves room for another
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(handler.retry_fits(started, delay));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!handler.retry_fits(started, delay));
    }

    #[test]
    fn maps_tweet_with_sorted_mp4_variants() {
        let raw = serde_json::json!({
            "code": 200,
            "tweet": {
                "text": "new piece",
                "created_timestamp": 1_700_000_000,
                "possibly_sensitive": true,
                "author": {"name": "Artist", "screen_name": "artist", "avatar_url": "https://pbs/a.jpg"},
                "media": {
                    "photos": [{"url": "https://pbs/1.jpg"}],
                    "videos": [{
                        "url": "https://video/main.mp4",
                        "thumbnail_url": "https://pbs/thumb.jpg",
                        "type": "video",
                        "variants": [
                            {"url": "https://video/low.mp4", "bitrate": 256000, "content_type": "video/mp4"},
                            {"url": "https://video/playlist.m3u8", "content_type": "application/x-mpegURL"},
                            {"url": "https://video/high.mp4", "bitrate": 2176000, "content_type": "video/mp4"}
                        ]
                    }]
                }
            }
        });
        let response: ApiResponse = serde_json::from_value(raw).expect("valid response");
        let tweet = response.tweet.expect("tweet present");
        let embed = map_tweet(tweet, "artist", "123").expect("embeddable");

        assert_eq!(embed.original_url, "https://x.com/artist/status/123");
        assert_eq!(embed.images, vec!["https://pbs/1.jpg"]);
        assert!(embed.is_nsfw);
        let video = &embed.videos[0];
        assert_eq!(video.variants.len(), 2);
        assert_eq!(video.best_url(), "https://video/high.mp4");
        assert_eq!(
            embed.rewritten_url.as_deref(),
            Some("https://fxtwitter.com/artist/status/123")
        );
    }

    #[test]
    fn tweet_without_content_is_not_embeddable() {
        let raw = serde_json::json!({
            "code": 200,
            "tweet": {"text": "  ", "author": {"name": "A", "screen_name": "a"}}
        });
        let response: ApiResponse = serde_json::from_value(raw).expect("valid response");
        assert!(map_tweet(response.tweet.expect("tweet"), "a", "1").is_none());
    }
}
