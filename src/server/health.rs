//! Health check endpoint for liveness probes.
//!
//! Returns 200 while both worker loops are running (or when no worker is
//! attached to this server) and 503 once either has stopped.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use super::AppState;
use crate::eventlog::EventLog;
use crate::store::KeyValueStore;

/// Health check handler.
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK
/// ```
pub async fn health_handler<L, S>(State(app): State<AppState<L, S>>) -> (StatusCode, &'static str)
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
{
    match app.worker_health() {
        Some(health) if !health.is_alive() => {
            warn!(
                main_running = health.main.is_running(),
                reclaim_running = health.reclaim.is_running(),
                main_heartbeat_ms = health.main.last_heartbeat_ms(),
                reclaim_heartbeat_ms = health.reclaim.last_heartbeat_ms(),
                "Health check failed: worker loop stopped"
            );
            (StatusCode::SERVICE_UNAVAILABLE, "worker stopped")
        }
        _ => (StatusCode::OK, "OK"),
    }
}
