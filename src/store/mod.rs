//! Key-value store for idempotency records and durable counters.
//!
//! Ingress and the worker never coordinate through in-process locks. Every
//! cross-task guarantee (one append per delivery id, one escalation per counter
//! crossing) rests on the atomic primitives of this trait:
//!
//! - [`KeyValueStore::set_if_absent`]: `SET key NX PX ttl`
//! - [`KeyValueStore::incr_with_ttl`]: `INCR key` + `PEXPIRE key ttl`
//!
//! Two implementations are provided: [`MemoryStore`] for standalone and test use,
//! and [`RedisStore`] for multi-process deployments.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// How long an accepted delivery id suppresses duplicates (24 hours).
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long an infrastructure-retry counter survives without updates (24 hours).
pub const DEFAULT_RETRY_COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors that can occur when talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis backend returned an error or the connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The backend is unavailable for another reason.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Atomic key-value operations with expiry.
pub trait KeyValueStore: Send + Sync {
    /// Sets `key` with the given TTL only if it does not exist.
    ///
    /// Returns `true` if the key was newly set, `false` if it already existed.
    fn set_if_absent(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically increments the integer at `key` and (re)sets its TTL.
    ///
    /// A missing key counts as zero, so the first call returns 1.
    fn incr_with_ttl(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<i64>> + Send;

    /// Deletes `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}
