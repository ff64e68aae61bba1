use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{AggregateError, FetchErrorKind};
use crate::model::{
    clamp_limit, AggregateResult, Item, LiveStatus, SourceResult, StreamState, MAX_LIMIT,
};

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";
const FEED_CACHE: &str = "public, max-age=300, s-maxage=600";

pub struct AppState {
    pub aggregator: Aggregator,
    /// Re-read on every dashboard request.
    pub config_path: PathBuf,
    /// Flips to `true` on shutdown; in-flight aggregations stop early.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    async fn dashboard(&self) -> Result<AggregateResult, AggregateError> {
        let config = Config::load_or_empty(&self.config_path).await;
        let mut shutdown = self.shutdown.clone();

        self.aggregator
            .aggregate_until(&config, async move {
                if shutdown.wait_for(|stopping| *stopping).await.is_err() {
                    // Sender gone without a shutdown: never cancel.
                    std::future::pending::<()>().await;
                }
            })
            .await
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/dashboard", get(dashboard))
        .route("/api/rss", get(rss))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub sections: Vec<SectionView>,
    pub live: Vec<LiveView>,
}

pub struct SectionView {
    pub title: String,
    pub cards: Vec<CardView>,
}

pub struct CardView {
    pub name: String,
    pub link: String,
    pub failed: bool,
    pub items: Vec<ItemView>,
}

pub struct ItemView {
    pub title: String,
    pub link: String,
    pub meta: String,
}

pub struct LiveView {
    pub channel: String,
    pub link: String,
    pub is_live: bool,
    pub status: String,
}

impl From<AggregateResult> for IndexTemplate {
    fn from(result: AggregateResult) -> Self {
        let mut sections: Vec<SectionView> = result
            .sections
            .into_iter()
            .map(|section| SectionView {
                title: section.title,
                cards: section.feeds.into_iter().map(CardView::from).collect(),
            })
            .collect();

        for (title, sources) in [("Reddit", result.subreddits), ("YouTube", result.youtube)] {
            if !sources.is_empty() {
                sections.push(SectionView {
                    title: title.to_string(),
                    cards: sources.into_iter().map(CardView::from).collect(),
                });
            }
        }

        Self {
            sections,
            live: result.twitch.into_iter().map(LiveView::from).collect(),
        }
    }
}

impl From<SourceResult> for CardView {
    fn from(source: SourceResult) -> Self {
        Self {
            name: source.source.name,
            link: source.result.site_url.unwrap_or_default(),
            failed: source.result.items.is_empty(),
            items: source.result.items.into_iter().map(ItemView::from).collect(),
        }
    }
}

impl From<Item> for ItemView {
    fn from(item: Item) -> Self {
        let mut meta = Vec::new();
        if !item.time_ago.is_empty() {
            meta.push(item.time_ago);
        }
        if let Some(score) = item.score {
            meta.push(format!("{} points", score));
        }
        if let Some(comments) = item.comments {
            meta.push(format!("{} comments", comments));
        }

        Self {
            title: item.title,
            link: item.link,
            meta: meta.join(" · "),
        }
    }
}

impl From<LiveStatus> for LiveView {
    fn from(status: LiveStatus) -> Self {
        let text = match &status.state {
            StreamState::Live {
                title,
                game,
                viewers,
            } => format!("LIVE · {} · {} viewers · {}", game, viewers, title),
            StreamState::Offline => "offline".to_string(),
            StreamState::Unknown => "unavailable".to_string(),
        };

        Self {
            link: format!("https://www.twitch.tv/{}", status.channel),
            channel: status.channel,
            is_live: status.is_live,
            status: text,
        }
    }
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Dashboard unavailable: {}", self.0),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

// Route handlers
pub async fn index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let result = state.dashboard().await?;

    Ok((
        [(header::CACHE_CONTROL, NO_CACHE)],
        HtmlTemplate(IndexTemplate::from(result)),
    ))
}

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.dashboard().await?;

    Ok(([(header::CACHE_CONTROL, NO_CACHE)], Json(result)))
}

#[derive(Deserialize)]
pub struct RssQuery {
    #[serde(rename = "feedUrl")]
    pub feed_url: Option<String>,
    pub limit: Option<String>,
}

impl RssQuery {
    /// Unparseable or zero limits fall back to the default; anything else
    /// is clamped into range, negatives included.
    pub fn limit(&self) -> usize {
        let requested = self
            .limit
            .as_deref()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .filter(|l| *l != 0)
            .map(|l| l.clamp(1, MAX_LIMIT as i64) as usize);
        clamp_limit(requested)
    }
}

pub async fn rss(State(state): State<Arc<AppState>>, Query(query): Query<RssQuery>) -> Response {
    let feed_url = match query.feed_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url,
        _ => return json_error(StatusCode::BAD_REQUEST, "Missing feedUrl parameter"),
    };
    if reqwest::Url::parse(feed_url).is_err() {
        return json_error(StatusCode::BAD_REQUEST, "Invalid feedUrl format");
    }

    let result = state.aggregator.feed(feed_url, query.limit()).await;

    match result.error {
        None => ([(header::CACHE_CONTROL, FEED_CACHE)], Json(result)).into_response(),
        Some(FetchErrorKind::NotFound) => json_error(StatusCode::NOT_FOUND, "Feed not found"),
        Some(FetchErrorKind::Timeout) => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "Feed request timed out")
        }
        Some(FetchErrorKind::Parse) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "Unable to parse feed format")
        }
        Some(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch feed"),
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetcher::{Fetcher, FetcherOptions};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
            <title>Test Feed</title>
            <link>https://feed.test/</link>
            <item><title>Article One</title><link>https://feed.test/1</link></item>
            <item><title>Article Two</title><link>https://feed.test/2</link></item>
        </channel></rss>"#;

    fn create_test_app(config: &str) -> (Router, NamedTempFile) {
        let mut config_file = NamedTempFile::new().unwrap();
        config_file.write_all(config.as_bytes()).unwrap();

        let fetcher = Fetcher::new(FetcherOptions::default()).unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let state = Arc::new(AppState {
            aggregator: Aggregator::new(fetcher, Settings::default()),
            config_path: config_file.path().to_path_buf(),
            shutdown,
        });

        (router(state), config_file)
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let (app, _config) = create_test_app("");

            let (status, body) = get_body(app, "/health").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK");
        }
    }

    mod index_tests {
        use super::*;

        #[tokio::test]
        async fn test_index_empty_config() {
            let (app, _config) = create_test_app("");

            let response = app
                .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CACHE_CONTROL], NO_CACHE);
        }

        #[tokio::test]
        async fn test_index_invalid_config_still_renders() {
            let (app, _config) = create_test_app("this is not valid toml {{{");

            let (status, _) = get_body(app, "/").await;
            assert_eq!(status, StatusCode::OK);
        }

        #[tokio::test]
        async fn test_index_shows_feed_items() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/feed.xml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .mount(&server)
                .await;

            let config = format!(
                r#"
                [[sections]]
                title = "Tech"

                [[sections.feeds]]
                name = "My Feed"
                url = "{}/feed.xml"
                "#,
                server.uri()
            );
            let (app, _config) = create_test_app(&config);

            let (status, body) = get_body(app, "/").await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.contains("Tech"));
            assert!(body.contains("My Feed"));
            assert!(body.contains("Article One"));
            assert!(body.contains("Article Two"));
        }

        #[tokio::test]
        async fn test_dashboard_json_keeps_shape() {
            let (app, _config) = create_test_app(
                r#"
                [[sections]]
                title = "Empty Section"
                "#,
            );

            let (status, body) = get_body(app, "/api/dashboard").await;
            assert_eq!(status, StatusCode::OK);

            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["sections"][0]["title"], "Empty Section");
            assert_eq!(json["subreddits"].as_array().unwrap().len(), 0);
            assert_eq!(json["twitch"].as_array().unwrap().len(), 0);
        }
    }

    mod rss_tests {
        use super::*;

        async fn mock_feed(status: u16, body: &str) -> MockServer {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/feed"))
                .respond_with(ResponseTemplate::new(status).set_body_string(body))
                .mount(&server)
                .await;
            server
        }

        #[tokio::test]
        async fn test_rss_missing_url() {
            let (app, _config) = create_test_app("");

            let (status, body) = get_body(app, "/api/rss").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.contains("Missing feedUrl parameter"));
        }

        #[tokio::test]
        async fn test_rss_invalid_url() {
            let (app, _config) = create_test_app("");

            let (status, body) = get_body(app, "/api/rss?feedUrl=not%20a%20url").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.contains("Invalid feedUrl format"));
        }

        #[tokio::test]
        async fn test_rss_success_with_limit() {
            let server = mock_feed(200, RSS).await;
            let (app, _config) = create_test_app("");

            let uri = format!("/api/rss?feedUrl={}/feed&limit=1", server.uri());
            let response = app
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CACHE_CONTROL], FEED_CACHE);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["title"], "Test Feed");
            assert_eq!(json["items"].as_array().unwrap().len(), 1);
            assert_eq!(json["items"][0]["title"], "Article One");
        }

        #[tokio::test]
        async fn test_rss_upstream_not_found() {
            let server = mock_feed(404, "gone").await;
            let (app, _config) = create_test_app("");

            let uri = format!("/api/rss?feedUrl={}/feed", server.uri());
            let (status, body) = get_body(app, &uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert!(body.contains("Feed not found"));
        }

        #[tokio::test]
        async fn test_rss_unparseable_feed() {
            let server = mock_feed(200, "<html>not a feed</html>").await;
            let (app, _config) = create_test_app("");

            let uri = format!("/api/rss?feedUrl={}/feed", server.uri());
            let (status, _) = get_body(app, &uri).await;
            assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        }

        #[tokio::test]
        async fn test_rss_upstream_error() {
            let server = mock_feed(503, "busy").await;
            let (app, _config) = create_test_app("");

            let uri = format!("/api/rss?feedUrl={}/feed", server.uri());
            let (status, body) = get_body(app, &uri).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body.contains("Failed to fetch feed"));
        }
    }

    mod view_tests {
        use super::*;

        #[test]
        fn test_item_meta_line() {
            let view = ItemView::from(Item {
                title: "Post".into(),
                link: "https://reddit.com/r/x/1".into(),
                time_ago: "3h ago".into(),
                score: Some(10),
                comments: Some(2),
                ..Default::default()
            });
            assert_eq!(view.meta, "3h ago · 10 points · 2 comments");

            let bare = ItemView::from(Item::default());
            assert_eq!(bare.meta, "");
        }

        #[test]
        fn test_live_view_text() {
            let live = LiveView::from(LiveStatus::live(
                "shroud",
                "ranked".into(),
                "VALORANT".into(),
                99,
            ));
            assert!(live.is_live);
            assert_eq!(live.link, "https://www.twitch.tv/shroud");
            assert_eq!(live.status, "LIVE · VALORANT · 99 viewers · ranked");

            let offline = LiveView::from(LiveStatus::offline("shroud"));
            assert_eq!(offline.status, "offline");

            let unknown = LiveView::from(LiveStatus::unknown("shroud", FetchErrorKind::Network));
            assert_eq!(unknown.status, "unavailable");
        }
    }

    mod rss_query_tests {
        use super::*;

        #[test]
        fn test_rss_query_default_limit() {
            let query: RssQuery = serde_urlencoded::from_str("feedUrl=https://x.test/feed").unwrap();
            assert_eq!(query.feed_url.as_deref(), Some("https://x.test/feed"));
            assert_eq!(query.limit(), 5);
        }

        #[test]
        fn test_rss_query_limit_parsing() {
            let parse = |q: &str| serde_urlencoded::from_str::<RssQuery>(q).unwrap().limit();
            assert_eq!(parse("limit=10"), 10);
            assert_eq!(parse("limit=0"), 5);
            assert_eq!(parse("limit=abc"), 5);
            assert_eq!(parse("limit=100"), 20);
            assert_eq!(parse("limit=-3"), 1);
        }
    }
}
