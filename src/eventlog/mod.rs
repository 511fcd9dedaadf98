//! Append-only event log with consumer groups.
//!
//! The log is the durable queue between ingress and the worker. Its semantics
//! follow Redis Streams:
//!
//! ```text
//! append      XADD stream * field value ...
//! read_group  XREADGROUP GROUP g c COUNT n BLOCK ms STREAMS stream >
//! auto_claim  XAUTOCLAIM stream g c min-idle 0-0 COUNT n
//! ack         XACK stream g id
//! ```
//!
//! An entry handed to a consumer by `read_group` stays *pending* until it is
//! acknowledged. Pending entries whose owner goes quiet for longer than an idle
//! threshold can be taken over by another consumer with `auto_claim`. This
//! ownership model is the only thing preventing two loops from processing the
//! same entry at once.
//!
//! Dead-letter sinks are ordinary streams in the same log that nobody reads
//! with a consumer group.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::types::EntryId;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryEventLog;
pub use self::redis::RedisEventLog;

/// Field/value pairs of one entry, in append order.
///
/// Values are raw bytes; stream values are binary-safe and request bodies are
/// stored exactly as received.
pub type Fields = Vec<(String, Vec<u8>)>;

/// Builds one field/value pair.
pub fn field_pair(name: &str, value: impl Into<Vec<u8>>) -> (String, Vec<u8>) {
    (name.to_string(), value.into())
}

/// Errors that can occur when talking to the event log.
#[derive(Debug, Error)]
pub enum LogError {
    /// The Redis backend returned an error or the connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// The consumer group does not exist on the stream.
    #[error("no consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// The backend is unavailable for another reason.
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// Result type for event log operations.
pub type Result<T> = std::result::Result<T, LogError>;

/// One entry as read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Log-assigned identifier.
    pub id: EntryId,
    /// Raw field values.
    pub fields: HashMap<String, Vec<u8>>,
}

impl LogEntry {
    pub fn new(id: EntryId, fields: HashMap<String, Vec<u8>>) -> Self {
        LogEntry { id, fields }
    }

    /// Returns a field value by name if it is valid UTF-8.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Returns a field value by name as raw bytes.
    pub fn field_bytes(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }
}

/// A consumer-group event log.
pub trait EventLog: Send + Sync {
    /// Creates `group` on `stream` (creating the stream if needed).
    ///
    /// Succeeds if the group already exists.
    fn ensure_group(&self, stream: &str, group: &str) -> impl Future<Output = Result<()>> + Send;

    /// Appends an entry to the tail of `stream` and returns its id.
    fn append(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> impl Future<Output = Result<EntryId>> + Send;

    /// Reads up to `count` never-delivered entries for `consumer`, waiting up to
    /// `block` for at least one to arrive.
    ///
    /// Returned entries become pending for `consumer`. An empty vector means the
    /// wait timed out.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<LogEntry>>> + Send;

    /// Transfers up to `count` entries that have been pending for at least
    /// `min_idle` to `consumer` and returns them.
    fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> impl Future<Output = Result<Vec<LogEntry>>> + Send;

    /// Acknowledges an entry, removing it from the group's pending list.
    fn ack(&self, stream: &str, group: &str, id: &EntryId) -> impl Future<Output = Result<()>> + Send;
}
