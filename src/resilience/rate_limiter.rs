//! Fixed-window rate limiting per guild and per guild member.
//!
//! `check` both tests and consumes budget; never call it speculatively.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    GuildLimited,
    UserLimited,
}

impl RateLimitDecision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allowed
    }
}

#[derive(Default)]
struct Counters {
    guilds: HashMap<String, RateLimitEntry>,
    users: HashMap<String, RateLimitEntry>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn check(&self, guild_id: &str, user_id: &str) -> RateLimitDecision {
        let now = Instant::now();
        let user_key = format!("{guild_id}:{user_id}");
        let mut counters = self.counters.lock();

        if !self.has_budget(counters.guilds.get(guild_id), self.config.guild_limit, now) {
            return RateLimitDecision::GuildLimited;
        }
        if !self.has_budget(counters.users.get(&user_key), self.config.user_limit, now) {
            return RateLimitDecision::UserLimited;
        }

        self.consume(&mut counters.guilds, guild_id.to_string(), now);
        self.consume(&mut counters.users, user_key, now);
        RateLimitDecision::Allowed
    }

    fn has_budget(&self, entry: Option<&RateLimitEntry>, limit: u32, now: Instant) -> bool {
        match entry {
            None => true,
            Some(entry) if now.duration_since(entry.window_start) >= self.config.window => true,
            Some(entry) => entry.count < limit,
        }
    }

    fn consume(&self, map: &mut HashMap<String, RateLimitEntry>, key: String, now: Instant) {
        let window = self.config.window;
        map.entry(key)
            .and_modify(|entry| {
                if now.duration_since(entry.window_start) >= window {
                    entry.count = 1;
                    entry.window_start = now;
                } else {
                    entry.count += 1;
                }
            })
            .or_insert(RateLimitEntry {
                count: 1,
                window_start: now,
            });
    }

    /// Purge entries whose window has elapsed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut counters = self.counters.lock();
        let before = counters.guilds.len() + counters.users.len();
        let fresh = |entry: &RateLimitEntry| now.duration_since(entry.window_start) < window;
        counters.guilds.retain(|_, entry| fresh(entry));
        counters.users.retain(|_, entry| fresh(entry));
        let removed = before - (counters.guilds.len() + counters.users.len());
        if removed > 0 {
            debug!(removed, "swept stale rate limit entries");
        }
        removed
    }
}
