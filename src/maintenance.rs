//! Periodic background sweeps over the pipeline's in-memory state

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::config::Config;
use crate::embed_enhancer::EmbedEnhancer;

const STATS_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub fn sweep_cache(enhancer: &EmbedEnhancer) -> usize {
    let removed = enhancer.components().cache.sweep();
    debug!(removed, remaining = enhancer.components().cache.len(), "cache sweep");
    removed
}

pub fn sweep_rate_limits(enhancer: &EmbedEnhancer) -> usize {
    let removed = enhancer.components().limiter.sweep();
    debug!(removed, "rate limit sweep");
    removed
}

pub async fn sweep_uploads(enhancer: &EmbedEnhancer) -> usize {
    enhancer.components().batcher.sweep().await
}

pub fn log_stats(enhancer: &EmbedEnhancer) {
    let stats = enhancer.stats();
    info!(
        messages = stats.messages_seen,
        enhanced = stats.messages_enhanced,
        resolved = stats.urls_resolved,
        failed = stats.urls_failed,
        dropped = stats.urls_dropped,
        cache_hits = stats.cache_hits,
        negative_hits = stats.negative_hits,
        breaker_skips = stats.breaker_skips,
        rate_limited = stats.rate_limited,
        duplicates = stats.duplicates,
        uploads = stats.uploads,
        "pipeline stats"
    );
}

/// Owns the scheduler running every sweep
pub struct Maintenance {
    scheduler: JobScheduler,
}

impl Maintenance {
    pub async fn start(enhancer: Arc<EmbedEnhancer>, config: &Config) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        add_job(&scheduler, config.cache.sweep_interval, Arc::clone(&enhancer), |enhancer| async move {
            sweep_cache(&enhancer);
        })
        .await?;
        add_job(&scheduler, config.rate_limit.sweep_interval, Arc::clone(&enhancer), |enhancer| async move {
            sweep_rate_limits(&enhancer);
        })
        .await?;
        add_job(&scheduler, config.batch.sweep_interval, Arc::clone(&enhancer), |enhancer| async move {
            sweep_uploads(&enhancer).await;
        })
        .await?;
        add_job(&scheduler, STATS_INTERVAL, enhancer, |enhancer| async move {
            log_stats(&enhancer);
        })
        .await?;

        scheduler.start().await?;
        info!(
            cache_secs = config.cache.sweep_interval.as_secs(),
            rate_limit_secs = config.rate_limit.sweep_interval.as_secs(),
            upload_secs = config.batch.sweep_interval.as_secs(),
            "maintenance jobs started"
        );
        Ok(Self { scheduler })
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await?;
        info!("maintenance jobs stopped");
        Ok(())
    }
}

async fn add_job<F, Fut>(
    scheduler: &JobScheduler,
    every: Duration,
    enhancer: Arc<EmbedEnhancer>,
    task: F,
) -> Result<()>
where
    F: Fn(Arc<EmbedEnhancer>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = Arc::new(task);
    scheduler
        .add(Job::new_repeated_async(every, move |_uuid, _l| {
            let enhancer = Arc::clone(&enhancer);
            let task = Arc::clone(&task);
            Box::pin(async move { task(enhancer).await })
        })?)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, CacheConfig, CircuitBreakerConfig, LedgerConfig, PipelineConfig, RateLimitConfig};
    use crate::embed_enhancer::Components;
    use crate::ledger::VoteLedger;
    use crate::matcher::UrlMatcher;
    use crate::resilience::{CircuitBreaker, EmbedCache, RateLimiter};
    use crate::storage::MemoryObjectStore;
    use crate::testing::{FakeMedia, RecordingChat};
    use crate::uploads::UploadBatcher;

    fn enhancer() -> EmbedEnhancer {
        let store = Arc::new(MemoryObjectStore::new("https://cdn.example"));
        let media = Arc::new(FakeMedia::default());
        let chat = Arc::new(RecordingChat::default());
        let components = Components {
            cache: Arc::new(EmbedCache::new(CacheConfig::default())),
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            ledger: Arc::new(VoteLedger::new(store.clone(), LedgerConfig::default())),
            batcher: Arc::new(UploadBatcher::new(
                BatchConfig::default(),
                store,
                media.clone(),
                chat.clone(),
            )),
        };
        EmbedEnhancer::new(PipelineConfig::default(), UrlMatcher::new(), components, media, chat)
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_drop_expired_state() {
        let enhancer = enhancer();
        enhancer.components().cache.set_negative("twitter:https://x.com/a/status/1");
        enhancer.components().limiter.check("guild", "alice");

        assert_eq!(sweep_cache(&enhancer), 0);
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;
        assert_eq!(sweep_cache(&enhancer), 1);
        assert!(sweep_rate_limits(&enhancer) >= 1);
        assert_eq!(sweep_uploads(&enhancer).await, 0);
        log_stats(&enhancer);
    }
}
