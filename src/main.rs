use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webhook_ingest::clock::{Clock, SystemClock};
use webhook_ingest::config::{Backend, Config, ConfigError};
use webhook_ingest::eventlog::{EventLog, LogError, MemoryEventLog, RedisEventLog};
use webhook_ingest::metrics::{Metrics, MetricsError};
use webhook_ingest::server::{AppState, build_router};
use webhook_ingest::store::{KeyValueStore, MemoryStore, RedisStore, StoreError};
use webhook_ingest::worker::{LoggingHandler, Worker};

#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("event log error: {0}")]
    Log(#[from] LogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match start().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal startup error");
            ExitCode::FAILURE
        }
    }
}

async fn start() -> Result<(), StartupError> {
    let config = Config::from_env()?;

    match &config.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory backend; accepted events are lost on exit");
            run(Arc::new(MemoryEventLog::new()), Arc::new(MemoryStore::new()), config).await
        }
        Backend::Redis { url } => {
            let log = RedisEventLog::connect(url).await?;
            let store = RedisStore::connect(url).await?;
            run(Arc::new(log), Arc::new(store), config).await
        }
    }
}

async fn run<L, S>(log: Arc<L>, store: Arc<S>, config: Config) -> Result<(), StartupError>
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Metrics::new()?;

    let worker = Worker::new(
        Arc::clone(&log),
        Arc::clone(&store),
        Arc::new(LoggingHandler),
        Arc::clone(&clock),
        metrics.clone(),
        config.worker.clone(),
    );
    worker.init().await?;
    let handle = worker.spawn();

    let state = AppState::new(log, store, clock, metrics, config.ingress)
        .with_worker_health(handle.health());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        stream = %config.worker.stream,
        consumer = %config.worker.consumer,
        "listening"
    );

    let stop = handle.shutdown_token();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = stop.cancelled() => {}
        }
    })
    .await;

    tracing::info!("Shutting down worker");
    handle.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
