//! Upstream fetchers, one per source kind.
//!
//! Every public `fetch_*` method performs exactly one outbound request and
//! never fails: errors are logged and folded into a degraded result.

mod feed;
mod reddit;
mod twitch;

use std::time::Duration;

use reqwest::Client;

use crate::error::FetchError;

pub use feed::parse_feed;
pub use reddit::parse_listing;
pub use twitch::parse_stream;

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; Feedboard/1.0)";

/// Base URLs of the upstream services.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub reddit: String,
    pub youtube: String,
    pub twitch_gql: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            reddit: "https://www.reddit.com".to_string(),
            youtube: "https://www.youtube.com".to_string(),
            twitch_gql: "https://gql.twitch.tv/gql".to_string(),
        }
    }
}

impl Endpoints {
    pub fn subreddit_url(&self, name: &str) -> String {
        format!("{}/r/{}/top.json", self.reddit.trim_end_matches('/'), name)
    }

    pub fn channel_feed_url(&self, channel_id: &str) -> String {
        format!(
            "{}/feeds/videos.xml?channel_id={}",
            self.youtube.trim_end_matches('/'),
            channel_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub endpoints: Endpoints,
    /// Request timeout for RSS/Atom and channel feeds.
    pub feed_timeout: Duration,
    /// Request timeout for the subreddit and live-status JSON APIs.
    pub api_timeout: Duration,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            feed_timeout: Duration::from_secs(15),
            api_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Fetcher {
    client: Client,
    options: FetcherOptions,
}

impl Fetcher {
    pub fn new(options: FetcherOptions) -> Result<Self, FetchError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self { client, options })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.options.endpoints
    }
}
