//! Queue-level data: envelopes, dead letters and retry scheduling.

pub mod backoff;
pub mod dead_letter;
pub mod envelope;

pub use backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_ATTEMPTS, RetryDecision, ScheduledRequeue,
};
pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use envelope::{EnvelopeError, EventEnvelope, SchemaError, WebhookEvent};
