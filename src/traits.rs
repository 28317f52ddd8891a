//! Traits and interfaces for platform-agnostic preview resolution

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;

use crate::error::FetchError;
use crate::models::{EmbedData, Platform};

/// Named capture groups extracted from a recognised URL
pub type MatchGroups = HashMap<String, String>;

/// Trait for platform-specific preview handlers
#[async_trait]
pub trait PlatformHandler: Send + Sync {
    /// Platform this handler resolves
    fn platform(&self) -> Platform;

    /// URL patterns recognised by this handler, tried in order
    fn patterns(&self) -> &[Regex];

    /// Match a URL against this handler's patterns
    ///
    /// # Returns
    /// * `Option<MatchGroups>` - Named captures of the first matching pattern
    fn match_url(&self, url: &str) -> Option<MatchGroups> {
        self.patterns().iter().find_map(|pattern| {
            let captures = pattern.captures(url)?;
            let groups = pattern
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.to_string(), m.as_str().to_string()))
                })
                .collect();
            Some(groups)
        })
    }

    /// Resolve preview metadata for a matched URL
    ///
    /// # Returns
    /// * `Ok(Some(_))` - Resolved preview
    /// * `Ok(None)` - URL recognised but nothing embeddable behind it
    /// * `Err(_)` - Transient upstream failure
    async fn fetch_embed(
        &self,
        groups: &MatchGroups,
        url: &str,
    ) -> Result<Option<EmbedData>, FetchError>;

    /// Canonical form of a matched URL, the same for every mirror host and
    /// query string. Cache keys and same-message dedup use it.
    fn canonical_url(&self, _groups: &MatchGroups) -> Option<String> {
        None
    }

    /// Link on a preview-rendering mirror, for platforms that have one
    fn fixup_url(&self, _groups: &MatchGroups) -> Option<String> {
        None
    }

    /// Get the user agent string for HTTP requests
    fn user_agent(&self) -> &'static str {
        "Mozilla/5.0 (compatible; EmbedEnhancer/0.1; +https://github.com/embed-enhancer)"
    }
}
