use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::Fetcher;
use crate::error::FetchError;
use crate::model::{
    strip_html, truncate_chars, FetchResult, Item, MAX_TITLE_LEN, NO_TITLE,
};
use crate::timeago::time_ago_epoch;

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
struct Child {
    data: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    title: String,
    permalink: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    #[serde(default)]
    created_utc: Option<f64>,
    #[serde(default)]
    stickied: bool,
}

impl Fetcher {
    /// Fetch today's top posts of a subreddit.
    pub async fn fetch_subreddit(&self, name: &str, limit: usize) -> FetchResult {
        let name = name.trim().trim_start_matches("r/");
        info!("Fetching subreddit: r/{}", name);

        match self.try_fetch_subreddit(name, limit).await {
            Ok(mut result) => {
                result.title = Some(format!("r/{}", name));
                result.site_url = Some(format!("https://www.reddit.com/r/{}", name));
                result
            }
            Err(e) => {
                warn!("Failed to fetch subreddit 'r/{}': {}", name, e);
                FetchResult::failed(e.kind())
            }
        }
    }

    async fn try_fetch_subreddit(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<FetchResult, FetchError> {
        let response = self
            .client
            .get(self.options.endpoints.subreddit_url(name))
            .query(&[("limit", limit.to_string()), ("t", "day".to_string())])
            .timeout(self.options.api_timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        parse_listing(&body, limit, Utc::now())
    }
}

/// Normalize a subreddit listing. Stickied posts are dropped before the
/// listing is cut down to `limit`.
pub fn parse_listing(
    body: &[u8],
    limit: usize,
    now: DateTime<Utc>,
) -> Result<FetchResult, FetchError> {
    let listing: Listing = serde_json::from_slice(body)?;

    let items = listing
        .data
        .children
        .into_iter()
        .map(|child| child.data)
        .filter(|post| !post.stickied)
        .take(limit)
        .map(|post| Item {
            title: match strip_html(&post.title) {
                title if title.is_empty() => NO_TITLE.to_string(),
                title => truncate_chars(&title, MAX_TITLE_LEN),
            },
            link: format!("https://reddit.com{}", post.permalink),
            time_ago: post
                .created_utc
                .map(|created| time_ago_epoch(created, now))
                .unwrap_or_default(),
            published: post
                .created_utc
                .and_then(|created| DateTime::from_timestamp(created as i64, 0)),
            score: Some(post.score),
            comments: Some(post.num_comments),
            ..Default::default()
        })
        .collect();

    Ok(FetchResult::from_items(items))
}
