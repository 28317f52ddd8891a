//! Per-platform circuit breaker.
//!
//! Closed: no entry or `is_open == false`. Open: `is_open` and the cooldown has
//! not elapsed. Half-open: `is_open` is still stored but `now >= open_until`;
//! the first check in that state lets one trial request through.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::models::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    pub failures: u32,
    pub last_failure: Instant,
    pub is_open: bool,
    pub open_until: Instant,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<Platform, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether calls to `platform` should be skipped.
    ///
    /// Moves an expired open breaker to half-open and returns `false` for that
    /// single check.
    pub fn is_open(&self, platform: Platform) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&platform) else {
            return false;
        };

        if !state.is_open {
            return false;
        }

        if Instant::now() >= state.open_until {
            state.is_open = false;
            state.failures = 0;
            info!(%platform, "circuit breaker half-open, allowing trial request");
            return false;
        }

        true
    }

    pub fn record_failure(&self, platform: Platform) {
        let now = Instant::now();
        let mut states = self.states.lock();
        let state = states.entry(platform).or_insert(BreakerState {
            failures: 0,
            last_failure: now,
            is_open: false,
            open_until: now,
        });

        state.failures += 1;
        state.last_failure = now;

        if state.failures >= self.config.failure_threshold {
            let was_open = state.is_open;
            state.is_open = true;
            state.open_until = now + self.config.cooldown;
            if !was_open {
                warn!(
                    %platform,
                    failures = state.failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit breaker opened"
                );
            }
        }
    }

    pub fn record_success(&self, platform: Platform) {
        if let Some(state) = self.states.lock().get_mut(&platform) {
            state.failures = 0;
            state.is_open = false;
        }
    }

    /// Snapshot of a platform's state, `None` when never failed
    pub fn state(&self, platform: Platform) -> Option<BreakerState> {
        self.states.lock().get(&platform).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let breaker = breaker();
        breaker.record_failure(Platform::Twitter);
        breaker.record_failure(Platform::Twitter);
        assert!(!breaker.is_open(Platform::Twitter));

        breaker.record_failure(Platform::Twitter);
        assert!(breaker.is_open(Platform::Twitter));
        assert!(breaker.is_open(Platform::Twitter), "stays open during cooldown");

        let state = breaker.state(Platform::Twitter).expect("state exists");
        assert!(state.open_until > state.last_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_allows_one_trial() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(Platform::Twitter);
        }

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(!breaker.is_open(Platform::Twitter));
        let state = breaker.state(Platform::Twitter).expect("state exists");
        assert_eq!(state.failures, 0);

        // trial fails: counter starts from zero again
        breaker.record_failure(Platform::Twitter);
        assert!(!breaker.is_open(Platform::Twitter));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failures() {
        let breaker = breaker();
        breaker.record_failure(Platform::Pixiv);
        breaker.record_failure(Platform::Pixiv);
        breaker.record_success(Platform::Pixiv);

        assert_eq!(breaker.state(Platform::Pixiv).map(|s| s.failures), Some(0));
        breaker.record_failure(Platform::Pixiv);
        assert!(!breaker.is_open(Platform::Pixiv));
    }

    #[tokio::test(start_paused = true)]
    async fn platforms_are_independent() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure(Platform::Twitter);
        }
        assert!(breaker.is_open(Platform::Twitter));
        assert!(!breaker.is_open(Platform::Pixiv));
        assert!(breaker.state(Platform::Pixiv).is_none());
    }
}
