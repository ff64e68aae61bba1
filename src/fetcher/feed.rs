use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use reqwest::header::ACCEPT;
use tracing::{info, warn};

use super::Fetcher;
use crate::error::FetchError;
use crate::model::{
    strip_html, truncate_chars, FetchResult, Item, MAX_SUMMARY_LEN, MAX_TITLE_LEN, NO_TITLE,
};
use crate::timeago::time_ago;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/xml, application/atom+xml, text/xml, */*";

impl Fetcher {
    /// Fetch an RSS, Atom or RDF feed and keep its first `limit` entries.
    pub async fn fetch_feed(&self, url: &str, limit: usize) -> FetchResult {
        info!("Fetching feed: {}", url);

        match self.try_fetch_feed(url, limit).await {
            Ok(result) => {
                info!("Parsed {} items from {}", result.items.len(), url);
                result
            }
            Err(e) => {
                warn!("Failed to fetch feed '{}': {}", url, e);
                FetchResult::failed(e.kind())
            }
        }
    }

    /// Fetch the uploads feed of a video channel.
    pub async fn fetch_channel(&self, channel_id: &str, limit: usize) -> FetchResult {
        let url = self.options.endpoints.channel_feed_url(channel_id);
        self.fetch_feed(&url, limit).await
    }

    async fn try_fetch_feed(&self, url: &str, limit: usize) -> Result<FetchResult, FetchError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, FEED_ACCEPT)
            .timeout(self.options.feed_timeout)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        parse_feed(&bytes, limit, Utc::now())
    }
}

/// Normalize a feed document into at most `limit` items, in document order.
pub fn parse_feed(xml: &[u8], limit: usize, now: DateTime<Utc>) -> Result<FetchResult, FetchError> {
    let feed = parser::parse(xml)?;

    let items = feed
        .entries
        .iter()
        .take(limit)
        .map(|entry| entry_to_item(entry, now))
        .collect();

    Ok(FetchResult {
        title: feed.title.map(|t| strip_html(&t.content)),
        site_url: preferred_link(&feed.links).map(String::from),
        items,
        error: None,
    })
}

fn entry_to_item(entry: &Entry, now: DateTime<Utc>) -> Item {
    let title = entry
        .title
        .as_ref()
        .map(|t| strip_html(&t.content))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| NO_TITLE.to_string());

    let published = entry.published.or(entry.updated);

    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .or_else(|| {
            entry
                .media
                .iter()
                .find_map(|m| m.description.as_ref().map(|d| d.content.clone()))
        })
        .map(|s| truncate_chars(&strip_html(&s), MAX_SUMMARY_LEN))
        .filter(|s| !s.is_empty());

    let thumbnail = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next();

    Item {
        title: truncate_chars(&title, MAX_TITLE_LEN),
        link: preferred_link(&entry.links).unwrap_or_default().to_string(),
        time_ago: published.map(|p| time_ago(p, now)).unwrap_or_default(),
        published,
        summary,
        thumbnail,
        score: None,
        comments: None,
    }
}

/// The alternate (or rel-less) link if there is one, else the first link.
fn preferred_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.as_str())
}
