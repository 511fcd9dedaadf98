//! Newtype wrappers for identifiers.
//!
//! A webhook delivery carries two identities that must never be confused: the
//! sender's delivery id (used for deduplication) and the id the event log assigns
//! to each appended entry (used for acknowledgment and the infrastructure retry
//! counter). Every retry copy of a delivery gets a fresh `EntryId` but keeps its
//! `DeliveryId`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A sender-supplied webhook delivery ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(s: impl Into<String>) -> Self {
        DeliveryId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the idempotency-store key recording that this delivery was accepted.
    pub fn dedupe_key(&self) -> String {
        format!("dedupe:{}", self.0)
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeliveryId {
    fn from(s: String) -> Self {
        DeliveryId(s)
    }
}

impl From<&str> for DeliveryId {
    fn from(s: &str) -> Self {
        DeliveryId(s.to_string())
    }
}

/// An identifier assigned by the event log when an entry is appended.
///
/// Unique and monotonic within one stream. Treated as opaque outside the log
/// implementations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new(s: impl Into<String>) -> Self {
        EntryId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the store key of the durable infrastructure-retry counter for this entry.
    pub fn retry_key(&self) -> String {
        format!("retry:{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}
