//! Manga Reader Server
//!
//! A self-hosted manga reader backend that recognizes page text in the
//! background through an external OCR inference service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use manga_reader_server::config::Config;
use manga_reader_server::ocr::{self, HttpInferenceClient, InferenceClient};
use manga_reader_server::state::AppState;
use manga_reader_server::{db, routes};

/// How long shutdown waits for running OCR jobs
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "manga_reader_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Manga Reader Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Inference service: {}", config.inference.base_url);

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let timeout = config.inference.timeout_secs.map(Duration::from_secs);
    let inference = HttpInferenceClient::new(&config.inference.base_url, timeout)
        .context("Failed to create inference client")?;
    if !inference.is_available().await {
        tracing::warn!("Inference service is not reachable yet; OCR jobs will fail until it is");
    }

    // Create application state
    let app_state = AppState::new(&config, db_pool.clone(), Arc::new(inference));

    // Repair whatever the previous run left behind, then queue the backlog
    let report = ocr::reconcile(&db_pool, config.ocr.retry_ceiling)
        .await
        .context("Failed to reconcile OCR state")?;
    app_state.scheduler().enqueue_backlog(&report.pending);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = routes::router(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Manga Reader Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Let running jobs land their results; waiting jobs are recovered next start
    app_state.scheduler().pause();
    if tokio::time::timeout(SHUTDOWN_GRACE, app_state.scheduler().workers_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = app_state.scheduler().depth().in_flight,
            "OCR workers still running at shutdown; their pages are reset on next start"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
