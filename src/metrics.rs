//! Prometheus counters for ingress and worker decisions.
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `webhook_ingress_requests_total` | `outcome` |
//! | `webhook_worker_entries_total` | `outcome` |
//! | `webhook_dead_letters_total` | `reason` |
//! | `webhook_infra_faults_total` | |
//!
//! Label values are fixed strings chosen by the caller, never request data.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// The counters exported at `/metrics`, backed by a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    ingress_requests: IntCounterVec,
    worker_entries: IntCounterVec,
    dead_letters: IntCounterVec,
    infra_faults: IntCounter,
}

impl Metrics {
    /// Creates the counters and registers them with a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ingress_requests = IntCounterVec::new(
            Opts::new(
                "webhook_ingress_requests_total",
                "Webhook requests by ingress decision",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(ingress_requests.clone()))?;

        let worker_entries = IntCounterVec::new(
            Opts::new(
                "webhook_worker_entries_total",
                "Log entries handled by the worker, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(worker_entries.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new("webhook_dead_letters_total", "Dead-lettered entries by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let infra_faults = IntCounter::new(
            "webhook_infra_faults_total",
            "Infrastructure faults while processing log entries",
        )?;
        registry.register(Box::new(infra_faults.clone()))?;

        Ok(Metrics {
            registry,
            ingress_requests,
            worker_entries,
            dead_letters,
            infra_faults,
        })
    }

    /// Records one ingress decision (`accepted`, `duplicate`, `rate_limited`, ...).
    pub fn ingress(&self, outcome: &str) {
        self.ingress_requests.with_label_values(&[outcome]).inc();
    }

    /// Records one processed entry (`completed`, `deferred`, `retry_scheduled`, ...).
    pub fn entry_processed(&self, outcome: &str) {
        self.worker_entries.with_label_values(&[outcome]).inc();
    }

    pub fn dead_lettered(&self, reason: &str) {
        self.dead_letters.with_label_values(&[reason]).inc();
    }

    pub fn infra_fault(&self) {
        self.infra_faults.inc();
    }

    /// Encodes all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    #[cfg(test)]
    pub fn ingress_count(&self, outcome: &str) -> u64 {
        self.ingress_requests.with_label_values(&[outcome]).get()
    }

    #[cfg(test)]
    pub fn entry_count(&self, outcome: &str) -> u64 {
        self.worker_entries.with_label_values(&[outcome]).get()
    }

    #[cfg(test)]
    pub fn dead_letter_count(&self, reason: &str) -> u64 {
        self.dead_letters.with_label_values(&[reason]).get()
    }

    #[cfg(test)]
    pub fn infra_fault_count(&self) -> u64 {
        self.infra_faults.get()
    }
}
