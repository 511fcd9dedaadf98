//! Webhook Ingest - signed webhook ingress with durable, exactly-once-effective
//! processing.
//!
//! Deliveries are authenticated and deduplicated at the HTTP edge, appended to a
//! consumer-group event log, and processed by a worker that retries business
//! failures with backoff, reclaims entries abandoned by crashed consumers, and
//! dead-letters what cannot succeed.

pub mod clock;
pub mod config;
pub mod eventlog;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod store;
pub mod types;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
