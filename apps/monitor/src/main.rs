use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use monitoring_cell::{
    DataSourceAdapter, LoggingNotifier, MetricsStore, MonitoringHandlers, Orchestrator, SqliteSourceAdapter,
};
use shared_config::MonitorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting data monitor");

    // Invalid configuration is fatal before anything starts
    let config = MonitorConfig::from_env().context("invalid monitor configuration")?;

    let store = MetricsStore::open(&config.database_path)
        .with_context(|| format!("cannot open metrics store at {}", config.database_path.display()))?;

    let adapters: Vec<Arc<dyn DataSourceAdapter>> = config
        .sources
        .iter()
        .map(|source| {
            Arc::new(SqliteSourceAdapter::new(
                source.name.clone(),
                source.path.clone(),
                config.collections.clone(),
            )) as Arc<dyn DataSourceAdapter>
        })
        .collect();
    if adapters.is_empty() {
        warn!("MONITOR_SOURCES is empty, no backends will be checked");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        adapters,
        store,
        Arc::new(LoggingNotifier),
    )?);
    orchestrator.restore().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cadences = orchestrator.spawn(shutdown_rx);

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let handlers = Arc::new(MonitoringHandlers::new(orchestrator));
    let app = router::create_router(handlers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    info!("Listening on {}", config.bind_addr);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping monitoring cadences");
    let _ = shutdown_tx.send(true);

    // Health checks settle within the grace period; give the other cadences the same again
    let drain = async {
        for handle in cadences {
            if let Err(e) = handle.await {
                error!("cadence task ended abnormally: {}", e);
            }
        }
    };
    if tokio::time::timeout(config.shutdown_grace * 2 + Duration::from_millis(500), drain)
        .await
        .is_err()
    {
        warn!("cadences still running after the shutdown grace period, exiting anyway");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
