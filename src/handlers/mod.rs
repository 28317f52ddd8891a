//! Platform handler implementations

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::traits::PlatformHandler;

pub mod bluesky;
pub mod deviantart;
pub mod pixiv;
pub mod twitter;

pub use bluesky::BlueskyHandler;
pub use deviantart::DeviantArtHandler;
pub use pixiv::PixivHandler;
pub use twitter::TwitterHandler;

/// Handlers in registration order
pub fn default_handlers(config: &Config) -> Result<Vec<Arc<dyn PlatformHandler>>> {
    let timeout = config.pipeline.fetch_timeout;
    Ok(vec![
        Arc::new(TwitterHandler::new(&config.twitter_api_base, timeout)?),
        Arc::new(PixivHandler::new()?),
        Arc::new(BlueskyHandler::new()?),
        Arc::new(DeviantArtHandler::new(timeout)?),
    ])
}
