use std::sync::Arc;

use anyhow::Result;
use serenity::all::Http;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod chat;
mod config;
mod discord;
mod embed_enhancer;
mod error;
mod handlers;
mod ledger;
mod maintenance;
mod matcher;
mod media;
mod models;
mod resilience;
mod scheduler;
mod storage;
#[cfg(test)]
mod testing;
mod traits;
mod uploads;

use chat::ChatPlatform;
use config::Config;
use discord::DiscordChat;
use embed_enhancer::{Components, EmbedEnhancer};
use ledger::VoteLedger;
use maintenance::Maintenance;
use matcher::UrlMatcher;
use media::{HttpMediaSource, MediaSource};
use resilience::{CircuitBreaker, EmbedCache, RateLimiter};
use storage::{FsObjectStore, ObjectStore};
use uploads::UploadBatcher;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting embed enhancer");

    let config = Config::from_env()?;

    let store: Arc<dyn ObjectStore> = Arc::new(
        FsObjectStore::new(
            &config.storage.root,
            config.storage.public_url.as_str(),
            config.storage.cdn_url.as_str(),
        )
        .await?,
    );
    let media: Arc<dyn MediaSource> = Arc::new(HttpMediaSource::new(config.pipeline.fetch_timeout)?);
    let chat: Arc<dyn ChatPlatform> =
        Arc::new(DiscordChat::new(Arc::new(Http::new(&config.discord_token))));

    let handlers = handlers::default_handlers(&config)?;
    info!(handlers = handlers.len(), "registered platform handlers");

    let components = Components {
        cache: Arc::new(EmbedCache::new(config.cache)),
        breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker)),
        limiter: Arc::new(RateLimiter::new(config.rate_limit)),
        ledger: Arc::new(VoteLedger::new(Arc::clone(&store), config.ledger.clone())),
        batcher: Arc::new(UploadBatcher::new(
            config.batch.clone(),
            Arc::clone(&store),
            Arc::clone(&media),
            Arc::clone(&chat),
        )),
    };
    let enhancer = Arc::new(EmbedEnhancer::new(
        config.pipeline.clone(),
        UrlMatcher::with_handlers(handlers),
        components,
        media,
        chat,
    ));

    let mut maintenance = Maintenance::start(Arc::clone(&enhancer), &config).await?;

    let mut client = discord::build_client(&config.discord_token, Arc::clone(&enhancer)).await?;
    let shard_manager = Arc::clone(&client.shard_manager);

    tokio::select! {
        result = client.start() => {
            if let Err(e) = result {
                error!("Discord client stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            shard_manager.shutdown_all().await;
        }
    }

    enhancer.components().batcher.shutdown();
    maintenance.shutdown().await?;
    info!(stats = ?enhancer.stats(), "Stopped");

    Ok(())
}
