//! Processing of one log entry.
//!
//! # Order of operations
//!
//! 1. Decode the envelope. Undecodable entries are dead-lettered as
//!    `invalid_event`.
//! 2. `next_ts` in the future: append the envelope again unchanged and ack.
//! 3. Schema gate. Failures are dead-lettered as `invalid_event`.
//! 4. Run the handler in its own task. A panic counts as a handler failure.
//! 5. Success: ack.
//! 6. Failure: append a retry copy with `attempts + 1` and a backoff `next_ts`,
//!    then ack; or dead-letter as `max_attempts` once attempts run out.
//!
//! Every append happens before the ack that retires the original entry, so a
//! crash in between duplicates work instead of losing it. Every ack is followed
//! by clearing the entry's infrastructure retry counter.
//!
//! Any event log or store error is returned to the calling loop as a
//! [`ProcessError`]; the entry then stays pending for the reclaim loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::WorkerConfig;
use super::handler::{EventHandler, HandlerError};
use crate::clock::Clock;
use crate::eventlog::{EventLog, LogEntry, LogError};
use crate::metrics::Metrics;
use crate::queue::{
    BackoffPolicy, DeadLetter, DeadLetterReason, EventEnvelope, RetryDecision, ScheduledRequeue,
    WebhookEvent,
};
use crate::store::{KeyValueStore, StoreError};

/// An infrastructure fault during processing.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("event log error: {0}")]
    Log(#[from] LogError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the processor did with an entry. Every variant means the entry was
/// acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not yet due; re-appended unchanged.
    Deferred,
    /// Dead-lettered as `invalid_event`.
    InvalidEvent,
    /// Handler succeeded.
    Completed,
    /// Handler failed; a retry copy was appended.
    RetryScheduled { attempts: u32, delay: Duration },
    /// Handler failed with no attempts left; dead-lettered as `max_attempts`.
    Exhausted,
}

impl ProcessOutcome {
    /// Metric label for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Deferred => "deferred",
            ProcessOutcome::InvalidEvent => "invalid_event",
            ProcessOutcome::Completed => "completed",
            ProcessOutcome::RetryScheduled { .. } => "retry_scheduled",
            ProcessOutcome::Exhausted => "exhausted",
        }
    }
}

/// Runs entries through decode, schedule, schema gate and handler.
pub struct Processor<L, S, H> {
    log: Arc<L>,
    store: Arc<S>,
    handler: Arc<H>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    stream: String,
    group: String,
    dlq_stream: String,
    backoff: BackoffPolicy,
}

impl<L, S, H> Processor<L, S, H>
where
    L: EventLog,
    S: KeyValueStore,
    H: EventHandler + 'static,
{
    pub fn new(
        log: Arc<L>,
        store: Arc<S>,
        handler: Arc<H>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: &WorkerConfig,
    ) -> Self {
        Processor {
            log,
            store,
            handler,
            clock,
            metrics,
            stream: config.stream.clone(),
            group: config.group.clone(),
            dlq_stream: config.dlq_stream.clone(),
            backoff: config.backoff,
        }
    }

    /// Processes one entry to an acknowledged outcome, or returns the fault
    /// that prevented it.
    pub async fn process(&self, entry: &LogEntry) -> Result<ProcessOutcome, ProcessError> {
        let envelope = match EventEnvelope::from_fields(&entry.fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Undecodable log entry");
                self.dead_letter(DeadLetter::undecodable(&entry.fields, &e))
                    .await?;
                self.retire(entry).await?;
                return Ok(ProcessOutcome::InvalidEvent);
            }
        };

        if envelope.is_deferred(self.clock.now_millis()) {
            debug!(
                entry_id = %entry.id,
                delivery_id = %envelope.delivery_id,
                next_ts = envelope.next_ts,
                "Entry not yet due, requeueing"
            );
            self.requeue(&ScheduledRequeue::deferred(envelope)).await?;
            self.retire(entry).await?;
            return Ok(ProcessOutcome::Deferred);
        }

        let event = match envelope.webhook_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    delivery_id = %envelope.delivery_id,
                    error = %e,
                    "Payload failed schema gate"
                );
                let letter = DeadLetter::for_envelope(
                    DeadLetterReason::InvalidEvent,
                    &envelope,
                    Some(e.to_string()),
                );
                self.dead_letter(letter).await?;
                self.retire(entry).await?;
                return Ok(ProcessOutcome::InvalidEvent);
            }
        };

        let failure = match self.invoke(&event, &envelope).await {
            Ok(()) => {
                self.retire(entry).await?;
                info!(
                    entry_id = %entry.id,
                    delivery_id = %envelope.delivery_id,
                    event = %event.event,
                    "Processed webhook event"
                );
                return Ok(ProcessOutcome::Completed);
            }
            Err(e) => e,
        };

        match self.backoff.decide(&envelope, self.clock.now_millis()) {
            RetryDecision::Requeue(requeue) => {
                warn!(
                    entry_id = %entry.id,
                    delivery_id = %envelope.delivery_id,
                    attempts = requeue.envelope.attempts,
                    delay_ms = u64::try_from(requeue.delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "Handler failed, scheduling retry"
                );
                self.requeue(&requeue).await?;
                self.retire(entry).await?;
                Ok(ProcessOutcome::RetryScheduled {
                    attempts: requeue.envelope.attempts,
                    delay: requeue.delay,
                })
            }
            RetryDecision::Exhausted => {
                warn!(
                    entry_id = %entry.id,
                    delivery_id = %envelope.delivery_id,
                    attempts = envelope.attempts,
                    error = %failure,
                    "Handler failed with no attempts left"
                );
                let letter = DeadLetter::for_envelope(
                    DeadLetterReason::MaxAttempts,
                    &envelope,
                    Some(failure.to_string()),
                );
                self.dead_letter(letter).await?;
                self.retire(entry).await?;
                Ok(ProcessOutcome::Exhausted)
            }
        }
    }

    /// Runs the handler on its own task so a panic unwinds that task only.
    async fn invoke(&self, event: &WebhookEvent, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        let event = event.clone();
        let envelope = envelope.clone();
        let task = tokio::spawn(async move { handler.handle(&event, &envelope).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(&*e.into_panic())
            ))),
            Err(e) => Err(HandlerError::new(format!("handler task failed: {e}"))),
        }
    }

    async fn requeue(&self, requeue: &ScheduledRequeue) -> Result<(), ProcessError> {
        let id = self
            .log
            .append(&self.stream, &requeue.envelope.to_fields())
            .await?;
        debug!(new_entry_id = %id, due_at = requeue.due_at(), "Requeued envelope");
        Ok(())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ProcessError> {
        self.log.append(&self.dlq_stream, &letter.to_fields()).await?;
        self.metrics.dead_lettered(letter.reason.as_str());
        Ok(())
    }

    /// Acknowledges the entry and clears its infrastructure retry counter.
    async fn retire(&self, entry: &LogEntry) -> Result<(), ProcessError> {
        self.log.ack(&self.stream, &self.group, &entry.id).await?;
        self.store.delete(&entry.id.retry_key()).await?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
