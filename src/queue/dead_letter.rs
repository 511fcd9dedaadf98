//! Dead-letter entries.
//!
//! Two sinks exist. The dead-letter queue receives entries that failed the
//! schema gate or exhausted their business retries. The dead sink receives
//! entries whose processing kept hitting infrastructure faults, and additionally
//! records the delivery id and acceptance time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::envelope::{EventEnvelope, encode_headers};
use crate::eventlog::{Fields, field_pair};

/// Why an entry was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Undecodable entry or payload failed the schema gate. Never retried.
    InvalidEvent,
    /// Business handler failed on every allowed attempt.
    MaxAttempts,
    /// Infrastructure faults exceeded the processing retry ceiling.
    ProcessingError,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::InvalidEvent => "invalid_event",
            DeadLetterReason::MaxAttempts => "max_attempts",
            DeadLetterReason::ProcessingError => "processing_error",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry bound for a dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    /// Raw request body, byte-exact.
    pub payload: Vec<u8>,
    /// Headers as serialized JSON.
    pub headers: String,
    pub error: Option<String>,
    /// Delivery id; written to the dead sink only.
    pub delivery_id: Option<String>,
    /// Acceptance time in unix milliseconds; written to the dead sink only.
    pub timestamp: Option<i64>,
}

impl DeadLetter {
    /// A schema or attempts failure for a decoded envelope.
    pub fn for_envelope(
        reason: DeadLetterReason,
        envelope: &EventEnvelope,
        error: Option<String>,
    ) -> Self {
        DeadLetter {
            reason,
            payload: envelope.payload.clone(),
            headers: envelope.headers_json(),
            error,
            delivery_id: None,
            timestamp: None,
        }
    }

    /// An `invalid_event` letter for an entry that could not be decoded.
    ///
    /// Whatever `payload` and `headers` the raw entry carries are preserved.
    pub fn undecodable(fields: &HashMap<String, Vec<u8>>, error: impl fmt::Display) -> Self {
        DeadLetter {
            reason: DeadLetterReason::InvalidEvent,
            payload: fields.get("payload").cloned().unwrap_or_default(),
            headers: raw_headers(fields),
            error: Some(error.to_string()),
            delivery_id: None,
            timestamp: None,
        }
    }

    /// A `processing_error` letter for the dead sink, built from raw entry fields.
    pub fn processing_error(fields: &HashMap<String, Vec<u8>>, error: impl fmt::Display) -> Self {
        DeadLetter {
            reason: DeadLetterReason::ProcessingError,
            payload: fields.get("payload").cloned().unwrap_or_default(),
            headers: raw_headers(fields),
            error: Some(error.to_string()),
            delivery_id: fields
                .get("id")
                .or_else(|| fields.get("delivery_id"))
                .map(|id| String::from_utf8_lossy(id).into_owned()),
            timestamp: fields
                .get("ts")
                .and_then(|ts| std::str::from_utf8(ts).ok())
                .and_then(|ts| ts.parse().ok()),
        }
    }

    /// Encodes the letter as event-log fields.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Vec::with_capacity(6);
        if let Some(id) = &self.delivery_id {
            fields.push(field_pair("id", id.as_str()));
        }
        if let Some(ts) = self.timestamp {
            fields.push(field_pair("ts", ts.to_string()));
        }
        fields.push(field_pair("reason", self.reason.as_str()));
        if let Some(error) = &self.error {
            fields.push(field_pair("error", error.as_str()));
        }
        fields.push(field_pair("payload", self.payload.clone()));
        fields.push(field_pair("headers", self.headers.as_str()));
        fields
    }
}

fn raw_headers(fields: &HashMap<String, Vec<u8>>) -> String {
    match fields.get("headers") {
        Some(raw) => String::from_utf8_lossy(raw).into_owned(),
        None => encode_headers(&BTreeMap::new()),
    }
}
