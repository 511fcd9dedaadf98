//! Worker tuning.
//!
//! # Loops
//!
//! - **Main loop**: blocking group reads of up to `read_count` new entries,
//!   waiting at most `block_timeout` per read. Read errors back off for
//!   `read_error_backoff`.
//! - **Reclaim loop**: every `reclaim_interval`, claims up to `reclaim_batch`
//!   entries that have been pending for longer than `reclaim_idle`.
//!
//! # Ceilings
//!
//! Business handler failures are bounded by `backoff.max_attempts`, carried in
//! the envelope across retry copies. Infrastructure faults are bounded by
//! `processing_retry_ceiling`, counted per log entry in the store. The two never
//! share a counter.

use std::time::Duration;

use crate::queue::BackoffPolicy;

pub const DEFAULT_STREAM: &str = "webhooks";
pub const DEFAULT_GROUP: &str = "webhook-workers";
pub const DEFAULT_DLQ_STREAM: &str = "webhooks:dlq";
pub const DEFAULT_DEAD_STREAM: &str = "webhooks:dead";

/// Default entries per group read.
pub const DEFAULT_READ_COUNT: usize = 10;

/// Default block duration for a group read (5 seconds).
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default pause after a failed group read (1 second).
pub const DEFAULT_READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Default idle time before a pending entry is reclaimed (60 seconds).
pub const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_secs(60);

pub const DEFAULT_RECLAIM_BATCH: usize = 50;

/// Default pause between reclaim passes (5 seconds).
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of infrastructure faults tolerated per entry.
pub const DEFAULT_PROCESSING_RETRY_CEILING: u32 = 5;

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The stream ingress appends to.
    pub stream: String,
    pub group: String,
    /// This process's consumer name. Must be unique among live workers.
    pub consumer: String,

    /// Sink for `invalid_event` and `max_attempts` letters.
    pub dlq_stream: String,
    /// Sink for `processing_error` letters.
    pub dead_stream: String,

    pub backoff: BackoffPolicy,

    pub read_count: usize,
    pub block_timeout: Duration,
    pub read_error_backoff: Duration,

    pub reclaim_idle: Duration,
    pub reclaim_batch: usize,
    pub reclaim_interval: Duration,

    /// Infrastructure faults tolerated before an entry goes to the dead sink.
    pub processing_retry_ceiling: u32,
}

impl WorkerConfig {
    /// Creates a configuration with defaults for everything but the consumer name.
    pub fn new(consumer: impl Into<String>) -> Self {
        WorkerConfig {
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            dlq_stream: DEFAULT_DLQ_STREAM.to_string(),
            dead_stream: DEFAULT_DEAD_STREAM.to_string(),
            backoff: BackoffPolicy::default(),
            read_count: DEFAULT_READ_COUNT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            read_error_backoff: DEFAULT_READ_ERROR_BACKOFF,
            reclaim_idle: DEFAULT_RECLAIM_IDLE,
            reclaim_batch: DEFAULT_RECLAIM_BATCH,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            processing_retry_ceiling: DEFAULT_PROCESSING_RETRY_CEILING,
        }
    }

    /// The default consumer name for this process: `worker-<pid>`.
    pub fn default_consumer() -> String {
        format!("worker-{}", std::process::id())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(Self::default_consumer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = WorkerConfig::new("c1");

        assert_eq!(config.stream, "webhooks");
        assert_eq!(config.group, "webhook-workers");
        assert_eq!(config.consumer, "c1");
        assert_eq!(config.dlq_stream, "webhooks:dlq");
        assert_eq!(config.dead_stream, "webhooks:dead");
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.backoff.base, Duration::from_secs(5));
        assert_eq!(config.read_count, 10);
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert_eq!(config.reclaim_idle, Duration::from_secs(60));
        assert_eq!(config.reclaim_batch, 50);
        assert_eq!(config.processing_retry_ceiling, 5);
    }

    #[test]
    fn default_consumer_includes_pid() {
        let consumer = WorkerConfig::default().consumer;
        assert_eq!(consumer, format!("worker-{}", std::process::id()));
    }
}
