//! Size-bounded media downloads

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Download {
    Complete {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    /// Body exceeded the caller's ceiling; nothing was kept
    TooLarge,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn download(&self, url: &str, max_bytes: Option<u64>) -> Result<Download>;
}

#[derive(Clone)]
pub struct HttpMediaSource {
    client: Client,
}

impl HttpMediaSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn download(&self, url: &str, max_bytes: Option<u64>) -> Result<Download> {
        let mut response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to download {}: {}", url, response.status()));
        }

        if let (Some(limit), Some(length)) = (max_bytes, response.content_length())
            && length > limit
        {
            debug!(%url, length, limit, "media exceeds size ceiling");
            return Ok(Download::TooLarge);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            data.extend_from_slice(&chunk);
            if max_bytes.is_some_and(|limit| data.len() as u64 > limit) {
                debug!(%url, "media exceeded size ceiling while streaming");
                return Ok(Download::TooLarge);
            }
        }

        Ok(Download::Complete { data, content_type })
    }
}
