use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FetchErrorKind;

pub const DEFAULT_LIMIT: usize = 5;
pub const MAX_LIMIT: usize = 20;

/// Maximum characters kept from a feed or subreddit title.
pub const MAX_TITLE_LEN: usize = 150;
/// Maximum characters kept from a live stream title.
pub const MAX_STREAM_TITLE_LEN: usize = 100;
pub const MAX_SUMMARY_LEN: usize = 280;
/// Shown for entries whose title is missing or empty after stripping.
pub const NO_TITLE: &str = "No title";

/// Where a source lives upstream. The set of variants is closed: each one
/// maps to exactly one fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    Feed { url: String },
    Subreddit { name: String },
    Channel { channel_id: String },
    LiveStatus { login: String },
}

impl Source {
    /// Canonical identity used as the cache key prefix.
    pub fn locator(&self) -> &str {
        match self {
            Source::Feed { url } => url,
            Source::Subreddit { name } => name,
            Source::Channel { channel_id } => channel_id,
            Source::LiveStatus { login } => login,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceConfig {
    pub name: String,
    pub category: String,
    pub limit: usize,
    pub source: Source,
}

impl SourceConfig {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        limit: Option<usize>,
        source: Source,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            limit: clamp_limit(limit),
            source,
        }
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Item {
    pub title: String,
    pub link: String,
    /// Relative age label, empty when the upstream gave no usable timestamp.
    pub time_ago: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<i64>,
}

/// Normalized output of a feed, subreddit or channel fetch.
///
/// A failed fetch has the same shape as a successful one with no items;
/// `error` records why.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    pub items: Vec<Item>,
    pub error: Option<FetchErrorKind>,
}

impl FetchResult {
    pub fn from_items(items: Vec<Item>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    pub fn failed(kind: FetchErrorKind) -> Self {
        Self {
            error: Some(kind),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StreamState {
    Live {
        title: String,
        game: String,
        viewers: u64,
    },
    Offline,
    /// The lookup itself failed; the channel may or may not be live.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveStatus {
    pub channel: String,
    pub is_live: bool,
    #[serde(flatten)]
    pub state: StreamState,
    pub error: Option<FetchErrorKind>,
}

impl LiveStatus {
    pub fn live(channel: impl Into<String>, title: String, game: String, viewers: u64) -> Self {
        Self {
            channel: channel.into(),
            is_live: true,
            state: StreamState::Live {
                title,
                game,
                viewers,
            },
            error: None,
        }
    }

    pub fn offline(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            is_live: false,
            state: StreamState::Offline,
            error: None,
        }
    }

    pub fn unknown(channel: impl Into<String>, kind: FetchErrorKind) -> Self {
        Self {
            channel: channel.into(),
            is_live: false,
            state: StreamState::Unknown,
            error: Some(kind),
        }
    }
}

/// A configured source paired with what was fetched for it.
#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source: SourceConfig,
    pub result: FetchResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionResult {
    pub title: String,
    pub feeds: Vec<SourceResult>,
}

/// Everything the presentation layer needs for one page render.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateResult {
    pub sections: Vec<SectionResult>,
    pub subreddits: Vec<SourceResult>,
    pub youtube: Vec<SourceResult>,
    pub twitch: Vec<LiveStatus>,
}

/// Strip markup from upstream text and collapse runs of whitespace.
pub fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return collapse_whitespace(html);
    }

    let fragment = scraper::Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect();
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, never splitting a character.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}
