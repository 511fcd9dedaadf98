//! Prometheus scrape endpoint.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use super::AppState;
use crate::eventlog::EventLog;
use crate::store::KeyValueStore;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `GET /metrics`: the text exposition of every counter.
pub async fn metrics_handler<L, S>(State(app): State<AppState<L, S>>) -> Response
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
{
    match app.metrics().encode_text() {
        Ok(text) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
