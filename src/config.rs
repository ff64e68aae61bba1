use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
    #[serde(default)]
    pub subreddits: Vec<String>,
    #[serde(default)]
    pub youtube_channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub twitch_channels: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SectionConfig {
    pub title: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    pub channel_id: String,
    pub name: String,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

/// Tunables for the aggregator and its caches.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub max_feeds: usize,
    pub max_subreddits: usize,
    pub max_channels: usize,
    pub max_live_channels: usize,
    /// Fetches allowed in flight at once across all sources.
    pub concurrency: usize,
    /// Wall-clock budget for one aggregation pass, in seconds.
    pub deadline_secs: u64,
    pub cache_ttl_secs: u64,
    pub live_cache_ttl_secs: u64,
    pub cache_wait_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_feeds: 15,
            max_subreddits: 3,
            max_channels: 3,
            max_live_channels: 5,
            concurrency: 6,
            deadline_secs: 20,
            cache_ttl_secs: 3600,
            live_cache_ttl_secs: 120,
            cache_wait_secs: 20,
        }
    }
}

impl Settings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load the config, falling back to an empty one if it is missing or
    /// invalid so the dashboard still renders.
    pub async fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Using empty configuration, {} unusable: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse config from a TOML string (useful for testing)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn source_count(&self) -> usize {
        self.sections.iter().map(|s| s.feeds.len()).sum::<usize>()
            + self.subreddits.len()
            + self.youtube_channels.len()
            + self.twitch_channels.len()
    }
}
