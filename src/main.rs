use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedboard::aggregator::Aggregator;
use feedboard::config::Config;
use feedboard::fetcher::{Fetcher, FetcherOptions};
use feedboard::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedboard=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Settings are fixed at startup; sources are re-read per request
    let config_path = PathBuf::from(
        std::env::var("FEEDBOARD_CONFIG").unwrap_or_else(|_| "dashboard.toml".to_string()),
    );
    let config = Config::load_or_empty(&config_path).await;
    info!(
        "Loaded {} sources from {}",
        config.source_count(),
        config_path.display()
    );

    let fetcher = Fetcher::new(FetcherOptions::default())?;
    let aggregator = Aggregator::new(fetcher, config.settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        aggregator,
        config_path,
        shutdown: shutdown_rx,
    });
    let app = routes::router(state);

    // Start server
    let addr = std::env::var("FEEDBOARD_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server starting on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested, cancelling in-flight aggregations");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
