//! Repost detection and vote ledger.
//!
//! The ledger is one JSON document in the object store. Reads go through a
//! short-TTL in-memory copy; every write reloads from the store, mutates,
//! saves, and drops the cached copy.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::models::Platform;
use crate::storage::{Acl, ObjectStore};

pub const SCHEMA_VERSION: u32 = 2;

static NUMERIC_ID: LazyLock<Vec<(Platform, Regex)>> = LazyLock::new(|| {
    [
        (Platform::Twitter, r"/status(?:es)?/(\d+)"),
        (Platform::Pixiv, r"/artworks/(\d+)"),
        (Platform::DeviantArt, r"/art/(?:[A-Za-z0-9-]*-)?(\d+)"),
    ]
    .into_iter()
    .map(|(platform, pattern)| {
        (
            platform,
            Regex::new(pattern).expect("artwork id patterns are valid"),
        )
    })
    .collect()
});

/// Stable identifier for duplicate detection and vote aggregation
pub fn artwork_id(platform: Platform, canonical_url: &str) -> String {
    let numeric = NUMERIC_ID
        .iter()
        .filter(|(candidate, _)| *candidate == platform)
        .find_map(|(_, pattern)| pattern.captures(canonical_url))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string());

    match numeric {
        Some(id) => format!("{platform}:{id}"),
        None => format!("{platform}:{canonical_url}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildVotes {
    #[serde(default)]
    pub voters: Vec<String>,
    #[serde(default)]
    pub vote_count: u32,
    pub shared_by: String,
    pub shared_at: DateTime<Utc>,
    pub message_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtworkVotes {
    pub artwork_id: String,
    pub original_url: String,
    pub platform: Platform,
    #[serde(default)]
    pub artist_username: String,
    #[serde(default)]
    pub artist_name: String,
    #[serde(default)]
    pub guild_votes: BTreeMap<String, GuildVotes>,
    #[serde(default)]
    pub global_vote_count: u32,
    pub first_shared_at: DateTime<Utc>,
    #[serde(default)]
    pub last_voted_at: Option<DateTime<Utc>>,
}

/// period key -> artwork id -> votes cast in that period
pub type Buckets = BTreeMap<String, BTreeMap<String, u32>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeAggregations {
    #[serde(default)]
    pub weekly: Buckets,
    #[serde(default)]
    pub monthly: Buckets,
    #[serde(default)]
    pub yearly: Buckets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Year,
}

impl Period {
    pub fn key(self, at: DateTime<Utc>) -> String {
        match self {
            Self::Week => {
                let week = at.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Self::Month => at.format("%Y-%m").to_string(),
            Self::Year => at.format("%Y").to_string(),
        }
    }
}

impl TimeAggregations {
    fn buckets_mut(&mut self, period: Period) -> &mut Buckets {
        match period {
            Period::Week => &mut self.weekly,
            Period::Month => &mut self.monthly,
            Period::Year => &mut self.yearly,
        }
    }

    fn buckets(&self, period: Period) -> &Buckets {
        match period {
            Period::Week => &self.weekly,
            Period::Month => &self.monthly,
            Period::Year => &self.yearly,
        }
    }

    fn adjust(&mut self, artwork_id: &str, at: DateTime<Utc>, added: bool) {
        for period in [Period::Week, Period::Month, Period::Year] {
            let key = period.key(at);
            let buckets = self.buckets_mut(period);
            if added {
                *buckets
                    .entry(key)
                    .or_default()
                    .entry(artwork_id.to_string())
                    .or_default() += 1;
                continue;
            }

            let Some(bucket) = buckets.get_mut(&key) else {
                continue;
            };
            if let Some(count) = bucket.get_mut(artwork_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    bucket.remove(artwork_id);
                }
            }
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
    }
}

fn legacy_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    #[serde(default)]
    pub votes: BTreeMap<String, ArtworkVotes>,
    #[serde(default)]
    pub time_aggregations: TimeAggregations,
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            votes: BTreeMap::new(),
            time_aggregations: TimeAggregations::default(),
            schema_version: SCHEMA_VERSION,
            last_updated: Utc::now(),
        }
    }
}

impl LedgerDocument {
    fn parse(raw: &[u8]) -> Result<Self> {
        let mut document: Self = serde_json::from_slice(raw).context("malformed ledger document")?;
        if document.schema_version < SCHEMA_VERSION {
            info!(
                from = document.schema_version,
                to = SCHEMA_VERSION,
                "migrating ledger document"
            );
            document.migrate();
        }
        Ok(document)
    }

    fn migrate(&mut self) {
        for entry in self.votes.values_mut() {
            for guild in entry.guild_votes.values_mut() {
                guild.voters.sort();
                guild.voters.dedup();
                guild.vote_count = guild.voters.len() as u32;
            }
            entry.global_vote_count = entry.guild_votes.values().map(|g| g.vote_count).sum();
        }
        self.schema_version = SCHEMA_VERSION;
    }
}

/// A share about to be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct ArtworkShare {
    pub artwork_id: String,
    pub original_url: String,
    pub platform: Platform,
    pub artist_username: String,
    pub artist_name: String,
    pub guild_id: String,
    pub shared_by: String,
    pub message_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateInfo {
    pub shared_by: String,
    pub shared_at: DateTime<Utc>,
    pub message_id: String,
    pub channel_id: String,
    pub minutes_ago: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteOutcome {
    pub added: bool,
    pub guild_vote_count: u32,
    pub global_vote_count: u32,
}

pub struct VoteLedger {
    store: Arc<dyn ObjectStore>,
    config: LedgerConfig,
    cached: parking_lot::Mutex<Option<(Instant, LedgerDocument)>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn ObjectStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            cached: parking_lot::Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load_fresh(&self) -> Result<LedgerDocument> {
        match self.store.get(&self.config.document_key).await? {
            Some(raw) => LedgerDocument::parse(&raw),
            None => Ok(LedgerDocument::default()),
        }
    }

    async fn load(&self) -> Result<LedgerDocument> {
        let ttl = self.config.read_cache_ttl;
        let cached = self
            .cached
            .lock()
            .as_ref()
            .filter(|(loaded_at, _)| loaded_at.elapsed() < ttl)
            .map(|(_, document)| document.clone());
        if let Some(document) = cached {
            return Ok(document);
        }

        let document = self.load_fresh().await?;
        *self.cached.lock() = Some((Instant::now(), document.clone()));
        Ok(document)
    }

    async fn save(&self, document: &mut LedgerDocument, now: DateTime<Utc>) -> Result<()> {
        document.last_updated = now;
        document.schema_version = SCHEMA_VERSION;
        let raw = serde_json::to_vec(document)?;
        self.store
            .put(&self.config.document_key, raw, "application/json", Acl::Private)
            .await
            .context("failed to persist ledger")?;
        self.cached.lock().take();
        Ok(())
    }

    /// Read-modify-write under the ledger's write lock
    async fn update<T>(
        &self,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut LedgerDocument) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        self.cached.lock().take();
        let mut document = self.load_fresh().await?;
        let result = mutate(&mut document)?;
        self.save(&mut document, now).await?;
        Ok(result)
    }

    /// Earlier share of the same artwork in `guild_id` within `window`
    pub async fn check_duplicate(
        &self,
        artwork_id: &str,
        guild_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DuplicateInfo>> {
        let document = self.load().await?;
        let Some(share) = document
            .votes
            .get(artwork_id)
            .and_then(|entry| entry.guild_votes.get(guild_id))
        else {
            return Ok(None);
        };

        let age = now.signed_duration_since(share.shared_at);
        let window = chrono::TimeDelta::from_std(window).unwrap_or(chrono::TimeDelta::MAX);
        if age >= window {
            return Ok(None);
        }

        Ok(Some(DuplicateInfo {
            shared_by: share.shared_by.clone(),
            shared_at: share.shared_at,
            message_id: share.message_id.clone(),
            channel_id: share.channel_id.clone(),
            minutes_ago: age.num_minutes().max(0),
        }))
    }

    /// Upsert the artwork and its per-guild share; an existing share is kept as-is
    pub async fn record_artwork(&self, share: ArtworkShare, now: DateTime<Utc>) -> Result<()> {
        let artwork_id = share.artwork_id.clone();
        let guild_id = share.guild_id.clone();
        self.update(now, |document| {
            let entry = document
                .votes
                .entry(share.artwork_id.clone())
                .or_insert_with(|| ArtworkVotes {
                    artwork_id: share.artwork_id.clone(),
                    original_url: share.original_url.clone(),
                    platform: share.platform,
                    artist_username: share.artist_username.clone(),
                    artist_name: share.artist_name.clone(),
                    guild_votes: BTreeMap::new(),
                    global_vote_count: 0,
                    first_shared_at: now,
                    last_voted_at: None,
                });

            if entry.artist_name.is_empty() {
                entry.artist_name = share.artist_name;
            }
            if entry.artist_username.is_empty() {
                entry.artist_username = share.artist_username;
            }

            entry
                .guild_votes
                .entry(share.guild_id)
                .or_insert_with(|| GuildVotes {
                    voters: Vec::new(),
                    vote_count: 0,
                    shared_by: share.shared_by,
                    shared_at: now,
                    message_id: share.message_id,
                    channel_id: share.channel_id,
                });
            Ok(())
        })
        .await?;

        debug!(%artwork_id, guild = %guild_id, "recorded artwork share");
        Ok(())
    }

    /// Flip `user_id`'s vote on an artwork in one guild
    pub async fn toggle_vote(
        &self,
        artwork_id: &str,
        guild_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        self.update(now, |document| {
            let entry = document
                .votes
                .get_mut(artwork_id)
                .ok_or_else(|| anyhow!("unknown artwork {artwork_id}"))?;
            let guild = entry
                .guild_votes
                .get_mut(guild_id)
                .ok_or_else(|| anyhow!("artwork {artwork_id} was never shared in {guild_id}"))?;

            let added = match guild.voters.iter().position(|voter| voter == user_id) {
                Some(index) => {
                    guild.voters.remove(index);
                    guild.vote_count = guild.vote_count.saturating_sub(1);
                    entry.global_vote_count = entry.global_vote_count.saturating_sub(1);
                    false
                }
                None => {
                    guild.voters.push(user_id.to_string());
                    guild.vote_count += 1;
                    entry.global_vote_count += 1;
                    true
                }
            };
            let guild_vote_count = guild.vote_count;
            entry.last_voted_at = Some(now);
            let global_vote_count = entry.global_vote_count;

            document.time_aggregations.adjust(artwork_id, now, added);

            Ok(VoteOutcome {
                added,
                guild_vote_count,
                global_vote_count,
            })
        })
        .await
    }

    pub async fn get_votes(&self, artwork_id: &str) -> Result<Option<ArtworkVotes>> {
        Ok(self.load().await?.votes.remove(artwork_id))
    }

    /// Most-voted artworks in the period containing `at`
    pub async fn top_artworks(
        &self,
        period: Period,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(String, u32)>> {
        let document = self.load().await?;
        let mut ranked: Vec<(String, u32)> = document
            .time_aggregations
            .buckets(period)
            .get(&period.key(at))
            .map(|bucket| bucket.iter().map(|(id, count)| (id.clone(), *count)).collect())
            .unwrap_or_default();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
