//! URL extraction and dispatch to registered platform handlers

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::models::Platform;
use crate::traits::{MatchGroups, PlatformHandler};

static URL_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`|]+"#).expect("URL token regex is valid"));

/// A URL recognised by one of the registered handlers
#[derive(Clone)]
pub struct MatchedUrl {
    pub url: String,
    /// Mirror-independent form; falls back to `url`
    pub canonical: String,
    pub platform: Platform,
    pub groups: MatchGroups,
    pub handler: Arc<dyn PlatformHandler>,
}

impl std::fmt::Debug for MatchedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchedUrl")
            .field("url", &self.url)
            .field("canonical", &self.canonical)
            .field("platform", &self.platform)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct UrlMatcher {
    handlers: Vec<Arc<dyn PlatformHandler>>,
}

impl UrlMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(handlers: impl IntoIterator<Item = Arc<dyn PlatformHandler>>) -> Self {
        let mut matcher = Self::new();
        for handler in handlers {
            matcher.register(handler);
        }
        matcher
    }

    pub fn register(&mut self, handler: Arc<dyn PlatformHandler>) {
        self.handlers.push(handler);
    }

    /// First registered handler that recognises `url`
    pub fn match_url(&self, url: &str) -> Option<MatchedUrl> {
        self.handlers.iter().find_map(|handler| {
            let groups = handler.match_url(url)?;
            Some(MatchedUrl {
                url: url.to_string(),
                canonical: handler
                    .canonical_url(&groups)
                    .unwrap_or_else(|| url.to_string()),
                platform: handler.platform(),
                groups,
                handler: Arc::clone(handler),
            })
        })
    }

    /// Every recognised URL in `text`, deduplicated by canonical form, in
    /// order of first appearance
    pub fn match_all(&self, text: &str) -> Vec<MatchedUrl> {
        let mut seen = HashSet::new();
        extract_urls(text)
            .into_iter()
            .filter_map(|url| self.match_url(&url))
            .filter(|matched| seen.insert(matched.canonical.clone()))
            .collect()
    }

    /// Canonical forms of every recognised URL in `text`
    pub fn canonical_urls(&self, text: &str) -> HashSet<String> {
        self.match_all(text)
            .into_iter()
            .map(|matched| matched.canonical)
            .collect()
    }
}

/// Raw `http(s)://` tokens in `text`, first occurrence wins
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    URL_TOKEN
        .find_iter(text)
        .map(|m| trim_trailing_punctuation(m.as_str()))
        .filter(|url| seen.insert(url.to_string()))
        .map(ToString::to_string)
        .collect()
}

/// Whether `text` carries any link at all, recognised or not
pub fn contains_url(text: &str) -> bool {
    URL_TOKEN.is_match(text)
}

fn trim_trailing_punctuation(url: &str) -> &str {
    let mut trimmed = url.trim_end_matches(['.', ',', '!', '?', ';', ':', '*', '_', '~']);
    // markdown links and parenthesised URLs
    while trimmed.ends_with(')') && trimmed.matches('(').count() < trimmed.matches(')').count() {
        trimmed = &trimmed[..trimmed.len() - 1];
    }
    while trimmed.ends_with('>') {
        trimmed = &trimmed[..trimmed.len() - 1];
    }
    trimmed
}
