//! The event envelope and its wire encoding as event-log fields.
//!
//! Wire fields of one log entry:
//!
//! | Field      | Contents                                         |
//! |------------|--------------------------------------------------|
//! | `id`       | sender delivery id (`delivery_id` accepted too)  |
//! | `ts`       | unix milliseconds at ingress acceptance          |
//! | `headers`  | lower-cased request headers as a JSON object     |
//! | `payload`  | raw request body                                 |
//! | `attempts` | business retry counter                           |
//! | `next_ts`  | unix milliseconds; only on retry/deferred copies |

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use thiserror::Error;

use crate::eventlog::{Fields, field_pair};
use crate::types::DeliveryId;

/// Errors decoding an envelope from log fields.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {0} is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("invalid integer in field {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("headers are not a JSON string map: {0}")]
    InvalidHeaders(#[source] serde_json::Error),
}

/// Reasons a payload fails the minimal schema gate.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotObject,

    #[error("payload has no string `event` field")]
    MissingEvent,

    #[error("payload `event` field is empty")]
    EmptyEvent,
}

/// A webhook delivery as carried through the event log.
///
/// Immutable once appended. A retry or deferral appends a new copy rather than
/// modifying the entry in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub delivery_id: DeliveryId,
    /// Unix milliseconds at ingress acceptance.
    pub timestamp: i64,
    pub headers: BTreeMap<String, String>,
    /// Raw request body, byte-exact. Not necessarily UTF-8.
    pub payload: Vec<u8>,
    pub attempts: u32,
    /// Do not process before this instant (unix milliseconds).
    pub next_ts: Option<i64>,
}

impl EventEnvelope {
    /// Creates a fresh envelope at `attempts = 0` with no schedule.
    pub fn new(
        delivery_id: DeliveryId,
        timestamp: i64,
        headers: BTreeMap<String, String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        EventEnvelope {
            delivery_id,
            timestamp,
            headers,
            payload: payload.into(),
            attempts: 0,
            next_ts: None,
        }
    }

    /// Returns true if processing must wait until a later time.
    pub fn is_deferred(&self, now_ms: i64) -> bool {
        self.next_ts.is_some_and(|due| due > now_ms)
    }

    /// Returns the copy to re-append after a business failure.
    pub fn retry_copy(&self, next_ts: i64) -> Self {
        EventEnvelope {
            attempts: self.attempts.saturating_add(1),
            next_ts: Some(next_ts),
            ..self.clone()
        }
    }

    /// The headers map serialized as a JSON object.
    pub fn headers_json(&self) -> String {
        encode_headers(&self.headers)
    }

    /// Encodes the envelope as event-log fields.
    pub fn to_fields(&self) -> Fields {
        let mut fields = vec![
            field_pair("id", self.delivery_id.to_string()),
            field_pair("ts", self.timestamp.to_string()),
            field_pair("headers", self.headers_json()),
            field_pair("payload", self.payload.clone()),
            field_pair("attempts", self.attempts.to_string()),
        ];
        if let Some(next_ts) = self.next_ts {
            fields.push(field_pair("next_ts", next_ts.to_string()));
        }
        fields
    }

    /// Decodes an envelope from event-log fields.
    ///
    /// `id` (or `delivery_id`), `ts` and `payload` are required. Missing
    /// `headers` decode as empty and missing `attempts` as zero. Every field
    /// except `payload` must be UTF-8.
    pub fn from_fields(fields: &HashMap<String, Vec<u8>>) -> Result<Self, EnvelopeError> {
        let delivery_id = match text(fields, "id")? {
            Some(id) => id,
            None => text(fields, "delivery_id")?.ok_or(EnvelopeError::MissingField("id"))?,
        };

        let timestamp = parse_required(fields, "ts")?;

        let payload = fields
            .get("payload")
            .ok_or(EnvelopeError::MissingField("payload"))?;

        let headers = match text(fields, "headers")? {
            Some(raw) => serde_json::from_str(raw).map_err(EnvelopeError::InvalidHeaders)?,
            None => BTreeMap::new(),
        };

        let attempts = match text(fields, "attempts")? {
            Some(raw) => parse_number("attempts", raw)?,
            None => 0,
        };

        let next_ts = match text(fields, "next_ts")? {
            Some(raw) if !raw.is_empty() => Some(parse_number("next_ts", raw)?),
            _ => None,
        };

        Ok(EventEnvelope {
            delivery_id: DeliveryId::new(delivery_id),
            timestamp,
            headers,
            payload: payload.clone(),
            attempts,
            next_ts,
        })
    }

    /// Applies the schema gate to the payload.
    pub fn webhook_event(&self) -> Result<WebhookEvent, SchemaError> {
        WebhookEvent::parse(&self.payload)
    }
}

pub(crate) fn encode_headers(headers: &BTreeMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn text<'a>(
    fields: &'a HashMap<String, Vec<u8>>,
    field: &'static str,
) -> Result<Option<&'a str>, EnvelopeError> {
    fields
        .get(field)
        .map(|raw| std::str::from_utf8(raw).map_err(|_| EnvelopeError::NotUtf8(field)))
        .transpose()
}

fn parse_required(fields: &HashMap<String, Vec<u8>>, field: &'static str) -> Result<i64, EnvelopeError> {
    let raw = text(fields, field)?.ok_or(EnvelopeError::MissingField(field))?;
    parse_number(field, raw)
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, EnvelopeError> {
    raw.trim().parse().map_err(|_| EnvelopeError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

/// A payload that passed the schema gate.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    /// The non-empty `event` discriminator.
    pub event: String,
    /// The full parsed payload.
    pub body: Value,
}

impl WebhookEvent {
    /// Parses `payload` and requires a JSON object with a non-empty string `event`.
    ///
    /// Bytes that are not UTF-8 fail as [`SchemaError::NotJson`].
    pub fn parse(payload: &[u8]) -> Result<Self, SchemaError> {
        let body: Value = serde_json::from_slice(payload).map_err(SchemaError::NotJson)?;
        let object = body.as_object().ok_or(SchemaError::NotObject)?;
        let event = object
            .get("event")
            .and_then(Value::as_str)
            .ok_or(SchemaError::MissingEvent)?;
        if event.trim().is_empty() {
            return Err(SchemaError::EmptyEvent);
        }
        Ok(WebhookEvent {
            event: event.to_string(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventEnvelope {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-webhook-id".to_string(), "d-1".to_string());
        EventEnvelope::new(
            DeliveryId::new("d-1"),
            1_700_000_000_000,
            headers,
            r#"{"event":"order.created","n":1}"#,
        )
    }

    fn as_map(fields: Fields) -> HashMap<String, Vec<u8>> {
        fields.into_iter().collect()
    }

    fn set(fields: &mut HashMap<String, Vec<u8>>, name: &str, value: &str) {
        fields.insert(name.to_string(), value.as_bytes().to_vec());
    }

    #[test]
    fn fresh_envelope_omits_next_ts() {
        let fields = as_map(sample().to_fields());

        assert_eq!(fields["id"], b"d-1");
        assert_eq!(fields["ts"], b"1700000000000");
        assert_eq!(fields["attempts"], b"0");
        assert!(!fields.contains_key("next_ts"));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let envelope = sample().retry_copy(1_700_000_005_000);
        let decoded = EventEnvelope::from_fields(&as_map(envelope.to_fields())).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn payload_is_byte_exact() {
        let mut envelope = sample();
        envelope.payload = "{ \"event\" : \"x\",\n  \"é\": 1 }".as_bytes().to_vec();
        let decoded = EventEnvelope::from_fields(&as_map(envelope.to_fields())).unwrap();
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[test]
    fn binary_payload_survives_and_fails_schema_gate() {
        let mut envelope = sample();
        envelope.payload = vec![0xff, 0xfe, b'{', b'}'];

        let decoded = EventEnvelope::from_fields(&as_map(envelope.to_fields())).unwrap();
        assert_eq!(decoded.payload, vec![0xff, 0xfe, b'{', b'}']);
        assert!(matches!(decoded.webhook_event(), Err(SchemaError::NotJson(_))));
    }

    #[test]
    fn non_utf8_metadata_is_rejected() {
        let mut fields = as_map(sample().to_fields());
        fields.insert("attempts".to_string(), vec![0xff]);

        assert!(matches!(
            EventEnvelope::from_fields(&fields),
            Err(EnvelopeError::NotUtf8("attempts"))
        ));
    }

    #[test]
    fn accepts_delivery_id_alias() {
        let mut fields = as_map(sample().to_fields());
        let id = fields.remove("id").unwrap();
        fields.insert("delivery_id".to_string(), id);

        let decoded = EventEnvelope::from_fields(&fields).unwrap();
        assert_eq!(decoded.delivery_id.as_str(), "d-1");
    }

    #[test]
    fn missing_optional_fields_default() {
        let mut fields = HashMap::new();
        set(&mut fields, "id", "d-2");
        set(&mut fields, "ts", "5");
        set(&mut fields, "payload", "{}");

        let decoded = EventEnvelope::from_fields(&fields).unwrap();
        assert_eq!(decoded.attempts, 0);
        assert!(decoded.headers.is_empty());
        assert_eq!(decoded.next_ts, None);
    }

    #[test]
    fn rejects_missing_and_malformed_fields() {
        let base = as_map(sample().to_fields());

        let mut no_id = base.clone();
        no_id.remove("id");
        assert!(matches!(
            EventEnvelope::from_fields(&no_id),
            Err(EnvelopeError::MissingField("id"))
        ));

        let mut bad_ts = base.clone();
        set(&mut bad_ts, "ts", "yesterday");
        assert!(matches!(
            EventEnvelope::from_fields(&bad_ts),
            Err(EnvelopeError::InvalidNumber { field: "ts", .. })
        ));

        let mut bad_attempts = base.clone();
        set(&mut bad_attempts, "attempts", "-1");
        assert!(matches!(
            EventEnvelope::from_fields(&bad_attempts),
            Err(EnvelopeError::InvalidNumber { field: "attempts", .. })
        ));

        let mut bad_headers = base;
        set(&mut bad_headers, "headers", "[1,2]");
        assert!(matches!(
            EventEnvelope::from_fields(&bad_headers),
            Err(EnvelopeError::InvalidHeaders(_))
        ));
    }

    #[test]
    fn retry_copy_increments_attempts_and_schedules() {
        let first = sample();
        let second = first.retry_copy(10);
        let third = second.retry_copy(20);

        assert_eq!(second.attempts, 1);
        assert_eq!(third.attempts, 2);
        assert_eq!(third.next_ts, Some(20));
        assert_eq!(third.delivery_id, first.delivery_id);
        assert_eq!(third.payload, first.payload);
    }

    #[test]
    fn deferral_is_strictly_future() {
        let mut envelope = sample();
        assert!(!envelope.is_deferred(0));

        envelope.next_ts = Some(1_000);
        assert!(envelope.is_deferred(999));
        assert!(!envelope.is_deferred(1_000));
        assert!(!envelope.is_deferred(1_001));
    }

    #[test]
    fn schema_gate_accepts_event_objects() {
        let event = WebhookEvent::parse(br#"{"event":"order.created","id":7}"#).unwrap();
        assert_eq!(event.event, "order.created");
        assert_eq!(event.body["id"], 7);
    }

    #[test]
    fn schema_gate_rejects_bad_shapes() {
        assert!(matches!(WebhookEvent::parse(b"not json"), Err(SchemaError::NotJson(_))));
        assert!(matches!(WebhookEvent::parse(b"[1]"), Err(SchemaError::NotObject)));
        assert!(matches!(WebhookEvent::parse(br#"{"type":"x"}"#), Err(SchemaError::MissingEvent)));
        assert!(matches!(WebhookEvent::parse(br#"{"event":5}"#), Err(SchemaError::MissingEvent)));
        assert!(matches!(WebhookEvent::parse(br#"{"event":"  "}"#), Err(SchemaError::EmptyEvent)));
    }
}
