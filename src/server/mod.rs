//! HTTP server for webhook ingress.
//!
//! # Endpoints
//!
//! - `POST /webhook` - Authenticates, deduplicates and appends deliveries (200 OK)
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /health` - 200 while the worker loops run, 503 otherwise

use std::sync::Arc;
use std::time::Duration;

pub mod allowlist;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod webhook;

pub use allowlist::IpAllowlist;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use rate_limit::RateLimit;
pub use webhook::{Accepted, IngressError, ingest, webhook_handler};

use crate::clock::Clock;
use crate::eventlog::EventLog;
use crate::metrics::Metrics;
use crate::store::{DEFAULT_DEDUPE_TTL, KeyValueStore};
use crate::worker::WorkerHealth;

/// Default request body ceiling (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Ingress settings.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Accepted signing secrets. More than one during rotation.
    pub secrets: Vec<Vec<u8>>,
    /// The stream accepted deliveries are appended to.
    pub stream: String,
    pub allowlist: IpAllowlist,
    pub rate_limit: RateLimit,
    pub max_body_bytes: usize,
    /// How long an accepted delivery id suppresses duplicates.
    pub dedupe_ttl: Duration,
}

impl IngressConfig {
    /// Creates a configuration with defaults for everything but the secrets.
    pub fn new(secrets: Vec<Vec<u8>>) -> Self {
        IngressConfig {
            secrets,
            stream: crate::worker::config::DEFAULT_STREAM.to_string(),
            allowlist: IpAllowlist::allow_all(),
            rate_limit: RateLimit::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            dedupe_ttl: DEFAULT_DEDUPE_TTL,
        }
    }
}

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<L, S> {
    inner: Arc<AppStateInner<L, S>>,
    worker_health: Option<Arc<WorkerHealth>>,
}

struct AppStateInner<L, S> {
    log: Arc<L>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    config: IngressConfig,
}

impl<L, S> Clone for AppState<L, S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
            worker_health: self.worker_health.clone(),
        }
    }
}

impl<L, S> AppState<L, S>
where
    L: EventLog,
    S: KeyValueStore,
{
    pub fn new(
        log: Arc<L>,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: IngressConfig,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                log,
                store,
                clock,
                metrics,
                config,
            }),
            worker_health: None,
        }
    }

    /// Reports the given worker's liveness at `/health`.
    pub fn with_worker_health(mut self, health: Arc<WorkerHealth>) -> Self {
        self.worker_health = Some(health);
        self
    }

    pub fn log(&self) -> &L {
        &self.inner.log
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.inner.clock.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &IngressConfig {
        &self.inner.config
    }

    pub fn worker_health(&self) -> Option<&WorkerHealth> {
        self.worker_health.as_deref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<L, S>(app_state: AppState<L, S>) -> axum::Router
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
{
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler::<L, S>))
        .route("/metrics", get(metrics_handler::<L, S>))
        .route("/health", get(health_handler::<L, S>))
        .with_state(app_state)
}
