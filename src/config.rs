//! Environment-driven configuration.
//!
//! Every tunable has a default; only `DISCORD_TOKEN` is required. Values are
//! read once at startup after `dotenvy` has populated the environment.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            negative_ttl: Duration::from_secs(5 * 60),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub guild_limit: u32,
    pub user_limit: u32,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            guild_limit: 30,
            user_limit: 5,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub window: Duration,
    pub cleanup_buffer: Duration,
    pub max_images: usize,
    pub duplicate_window: Duration,
    pub sweep_interval: Duration,
    /// Key prefix under which staged uploads live
    pub storage_prefix: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            cleanup_buffer: Duration::from_secs(10 * 60),
            max_images: 10,
            duplicate_window: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            storage_prefix: "temp-uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Object-store key of the ledger JSON document
    pub document_key: String,
    pub read_cache_ttl: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            document_key: "ledger/votes.json".to_string(),
            read_cache_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Channel ids or names; empty allows every channel
    pub allowed_channels: Vec<String>,
    pub max_urls_per_message: usize,
    pub max_cards_per_message: usize,
    pub fetch_timeout: Duration,
    pub max_video_bytes: u64,
    pub duplicate_window: Duration,
    pub edit_window: Duration,
    pub resuppress_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allowed_channels: Vec::new(),
            max_urls_per_message: 5,
            max_cards_per_message: 10,
            fetch_timeout: Duration::from_secs(10),
            max_video_bytes: 25 * 1024 * 1024,
            duplicate_window: Duration::from_secs(24 * 60 * 60),
            edit_window: Duration::from_secs(15 * 60),
            resuppress_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Local directory backing the object store
    pub root: String,
    /// Base URL objects are served from at the origin
    pub public_url: String,
    /// Base URL of the CDN edge in front of the origin
    pub cdn_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "storage".to_string(),
            public_url: "http://localhost:8080".to_string(),
            cdn_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub twitter_api_base: String,
    pub pipeline: PipelineConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };

        let discord_token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow!("DISCORD_TOKEN must be set"))?;

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            allowed_channels: lookup("ALLOWED_CHANNELS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            max_urls_per_message: env
                .parse("MAX_URLS_PER_MESSAGE", pipeline_defaults.max_urls_per_message)?,
            max_cards_per_message: env
                .parse("MAX_CARDS_PER_MESSAGE", pipeline_defaults.max_cards_per_message)?,
            fetch_timeout: env.secs("FETCH_TIMEOUT_SECS", pipeline_defaults.fetch_timeout)?,
            max_video_bytes: env.parse("MAX_VIDEO_BYTES", pipeline_defaults.max_video_bytes)?,
            duplicate_window: env
                .secs("DUPLICATE_WINDOW_SECS", pipeline_defaults.duplicate_window)?,
            edit_window: env.secs("EDIT_WINDOW_SECS", pipeline_defaults.edit_window)?,
            resuppress_delay: env
                .secs("RESUPPRESS_DELAY_SECS", pipeline_defaults.resuppress_delay)?,
        };

        let breaker_defaults = CircuitBreakerConfig::default();
        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env
                .parse("BREAKER_THRESHOLD", breaker_defaults.failure_threshold)?,
            cooldown: env.secs("BREAKER_COOLDOWN_SECS", breaker_defaults.cooldown)?,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            ttl: env.secs("CACHE_TTL_SECS", cache_defaults.ttl)?,
            negative_ttl: env.secs("NEGATIVE_CACHE_TTL_SECS", cache_defaults.negative_ttl)?,
            max_entries: env.parse("CACHE_MAX_ENTRIES", cache_defaults.max_entries)?,
            sweep_interval: cache_defaults.sweep_interval,
        };

        let limit_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            guild_limit: env.parse("RATE_LIMIT_GUILD", limit_defaults.guild_limit)?,
            user_limit: env.parse("RATE_LIMIT_USER", limit_defaults.user_limit)?,
            window: env.secs("RATE_LIMIT_WINDOW_SECS", limit_defaults.window)?,
            sweep_interval: limit_defaults.sweep_interval,
        };

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            window: env.secs("BATCH_WINDOW_SECS", batch_defaults.window)?,
            cleanup_buffer: env.secs("BATCH_CLEANUP_BUFFER_SECS", batch_defaults.cleanup_buffer)?,
            max_images: env.parse("BATCH_MAX_IMAGES", batch_defaults.max_images)?,
            duplicate_window: env
                .secs("UPLOAD_DUPLICATE_WINDOW_SECS", batch_defaults.duplicate_window)?,
            ..batch_defaults
        };

        let ledger_defaults = LedgerConfig::default();
        let ledger = LedgerConfig {
            document_key: lookup("LEDGER_KEY").unwrap_or(ledger_defaults.document_key),
            ..ledger_defaults
        };

        let storage_defaults = StorageConfig::default();
        let public_url = lookup("STORAGE_PUBLIC_URL").unwrap_or(storage_defaults.public_url);
        let storage = StorageConfig {
            root: lookup("STORAGE_ROOT").unwrap_or(storage_defaults.root),
            cdn_url: lookup("STORAGE_CDN_URL").unwrap_or_else(|| public_url.clone()),
            public_url,
        };

        Ok(Self {
            discord_token,
            twitter_api_base: lookup("TWITTER_API_BASE")
                .unwrap_or_else(|| "https://api.fxtwitter.com".to_string()),
            pipeline,
            circuit_breaker,
            cache,
            rate_limit,
            batch,
            ledger,
            storage,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}
