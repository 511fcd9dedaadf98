//! The business handler seam.

use std::future::Future;

use thiserror::Error;
use tracing::info;

use crate::queue::{EventEnvelope, WebhookEvent};

/// A business-handler failure. Always treated as transient and retried with
/// backoff until the envelope's attempts run out.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }
}

/// Performs the side effects of one event.
///
/// Delivery is at-least-once: the same delivery id can reach `handle` again
/// after a crash between the side effect and the acknowledgment, so
/// implementations must be idempotent per `envelope.delivery_id`.
pub trait EventHandler: Send + Sync {
    fn handle(
        &self,
        event: &WebhookEvent,
        envelope: &EventEnvelope,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// A handler that logs each event and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &WebhookEvent, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        info!(
            delivery_id = %envelope.delivery_id,
            event = %event.event,
            attempts = envelope.attempts,
            "Handled webhook event"
        );
        Ok(())
    }
}
