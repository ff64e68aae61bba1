use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Failure while talking to a single upstream source.
///
/// These never escape the fetchers: they are logged and folded into an
/// empty result (or an unknown live status) tagged with [`FetchErrorKind`].
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("upstream returned {0}")]
    Status(StatusCode),

    #[error("Feed parsing failed: {0}")]
    FeedParse(#[from] feed_rs::parser::ParseFeedError),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Malformed payload: {0}")]
    MissingData(String),

    #[error("Channel not found: {0}")]
    UnknownChannel(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status)
        } else {
            FetchError::Http(err)
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout => FetchErrorKind::Timeout,
            FetchError::Http(_) => FetchErrorKind::Network,
            FetchError::Status(status) if *status == StatusCode::NOT_FOUND => {
                FetchErrorKind::NotFound
            }
            FetchError::Status(_) => FetchErrorKind::BadStatus,
            FetchError::FeedParse(_) | FetchError::Payload(_) | FetchError::MissingData(_) => {
                FetchErrorKind::Parse
            }
            FetchError::UnknownChannel(_) => FetchErrorKind::NotFound,
        }
    }
}

/// Classification attached to degraded results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    Network,
    NotFound,
    BadStatus,
    Parse,
    /// Source was beyond its class cap and never fetched.
    Skipped,
    /// Still pending when the aggregation was cancelled.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Unexpected internal failure while assembling a dashboard.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("fetch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("task for {0} returned a mismatched result")]
    Mismatch(String),
}
