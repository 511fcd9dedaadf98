//! Webhook ingress endpoint.
//!
//! Authenticates a delivery, records its id for deduplication and appends it
//! to the event log before answering. Processing happens later in the worker.
//!
//! # Gates
//!
//! Checked in order; the first failure answers the request.
//!
//! | Gate | Failure |
//! |------|---------|
//! | fixed-window rate limit per source IP | 429 |
//! | source IP allowlist | 403 |
//! | `Content-Type: application/json` | 400 |
//! | `x-webhook-id` or `idempotency-key` present | 400 |
//! | body within the size ceiling | 413 |
//! | signature valid for any configured secret | 400 |
//!
//! The body is stored byte-exact. Whether it is well-formed JSON is the
//! worker's schema gate to decide, so a malformed payload ends up in the
//! dead-letter queue rather than bouncing back to the sender.
//!
//! Then `dedupe:<delivery_id>` is set-if-absent. A delivery id already seen
//! within the TTL answers 200 without appending. If the append fails, the
//! dedupe key is deleted again and the request fails with 503 so the sender's
//! retry is not swallowed as a duplicate.
//!
//! Response bodies never say more than the short reason text, so a prober
//! learns nothing about which part of a signature was wrong.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::eventlog::{EventLog, LogError};
use crate::queue::EventEnvelope;
use crate::store::{KeyValueStore, StoreError};
use crate::types::{DeliveryId, EntryId};
use crate::webhooks::{SignatureHeaders, verify_any};

/// Header carrying the sender's delivery id.
pub const HEADER_DELIVERY_ID: &str = "x-webhook-id";
/// Accepted alias for [`HEADER_DELIVERY_ID`].
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
/// Header carrying the v2 signature.
pub const HEADER_SIGNATURE: &str = "x-webhook-signature";
/// Header carrying the v2 signing timestamp (unix seconds).
pub const HEADER_TIMESTAMP: &str = "x-webhook-timestamp";
/// Header carrying the legacy body-only signature.
pub const HEADER_LEGACY_SIGNATURE: &str = "x-hub-signature-256";

/// Reasons ingress rejects or fails a request.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("rate limited")]
    RateLimited,

    #[error("forbidden")]
    Forbidden,

    #[error("invalid content-type")]
    InvalidContentType,

    #[error("missing delivery id")]
    MissingDeliveryId,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("invalid signature")]
    InvalidSignature,

    /// The idempotency store could not be reached.
    #[error("idempotency store error: {0}")]
    Store(#[source] StoreError),

    /// The event log rejected the append.
    #[error("append failed: {0}")]
    Append(#[source] LogError),
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            IngressError::Forbidden => StatusCode::FORBIDDEN,
            IngressError::InvalidContentType
            | IngressError::MissingDeliveryId
            | IngressError::InvalidSignature => StatusCode::BAD_REQUEST,
            IngressError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            IngressError::Store(_) | IngressError::Append(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Metric label for this rejection.
    pub fn outcome(&self) -> &'static str {
        match self {
            IngressError::RateLimited => "rate_limited",
            IngressError::Forbidden => "forbidden",
            IngressError::InvalidContentType => "invalid_content_type",
            IngressError::MissingDeliveryId => "missing_delivery_id",
            IngressError::PayloadTooLarge => "payload_too_large",
            IngressError::InvalidSignature => "invalid_signature",
            IngressError::Store(_) => "store_unavailable",
            IngressError::Append(_) => "append_failed",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            IngressError::Store(_) | IngressError::Append(_) => "unavailable",
            IngressError::RateLimited => "rate limited",
            IngressError::Forbidden => "forbidden",
            IngressError::InvalidContentType => "invalid content-type",
            IngressError::MissingDeliveryId => "missing delivery id",
            IngressError::PayloadTooLarge => "payload too large",
            IngressError::InvalidSignature => "invalid signature",
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}

/// A successfully handled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// First sighting; appended under this entry id.
    Appended(EntryId),
    /// Already accepted within the dedupe TTL; nothing appended.
    Duplicate,
}

impl Accepted {
    pub fn outcome(&self) -> &'static str {
        match self {
            Accepted::Appended(_) => "accepted",
            Accepted::Duplicate => "duplicate",
        }
    }
}

/// `POST /webhook`.
///
/// # Response
///
/// - 200 `ok`: appended, or a duplicate of an accepted delivery
/// - 400: bad content type, missing delivery id or bad signature
/// - 403: source address not allowlisted
/// - 413: body over the size ceiling
/// - 429: rate limited
/// - 503: idempotency store or event log unavailable
pub async fn webhook_handler<L, S>(
    State(app): State<AppState<L, S>>,
    request: Request,
) -> Result<(StatusCode, &'static str), IngressError>
where
    L: EventLog + 'static,
    S: KeyValueStore + 'static,
{
    let result = receive(&app, request).await;
    match &result {
        Ok(accepted) => app.metrics().ingress(accepted.outcome()),
        Err(e) => app.metrics().ingress(e.outcome()),
    }
    result.map(|_| (StatusCode::OK, "ok"))
}

async fn receive<L, S>(app: &AppState<L, S>, request: Request) -> Result<Accepted, IngressError>
where
    L: EventLog,
    S: KeyValueStore,
{
    let (parts, body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let config = app.config();

    if let Some(ip) = peer {
        check_rate_limit(app, ip).await?;
    }

    if !config.allowlist.is_empty() && !peer.is_some_and(|ip| config.allowlist.allows(ip)) {
        warn!(peer = ?peer, "Rejected webhook from address outside allowlist");
        return Err(IngressError::Forbidden);
    }

    if !is_json_content_type(&parts.headers) {
        return Err(IngressError::InvalidContentType);
    }

    let delivery_id = delivery_id(&parts.headers).ok_or(IngressError::MissingDeliveryId)?;

    let body = axum::body::to_bytes(body, config.max_body_bytes)
        .await
        .map_err(|_| IngressError::PayloadTooLarge)?;

    let signatures = SignatureHeaders {
        timestamp: header_str(&parts.headers, HEADER_TIMESTAMP),
        signature: header_str(&parts.headers, HEADER_SIGNATURE),
        legacy_signature: header_str(&parts.headers, HEADER_LEGACY_SIGNATURE),
    };
    if !verify_any(&body, &signatures, &config.secrets, app.clock().now_secs()) {
        warn!(delivery_id = %delivery_id, "Invalid webhook signature");
        return Err(IngressError::InvalidSignature);
    }

    debug!(delivery_id = %delivery_id, bytes = body.len(), "Webhook authenticated");

    let envelope = EventEnvelope::new(
        delivery_id,
        app.clock().now_millis(),
        extract_headers(&parts.headers),
        body.to_vec(),
    );
    ingest(app, envelope).await
}

/// Counts the request against the sender's window. Store faults let the
/// request through.
async fn check_rate_limit<L, S>(app: &AppState<L, S>, ip: IpAddr) -> Result<(), IngressError>
where
    L: EventLog,
    S: KeyValueStore,
{
    match app
        .config()
        .rate_limit
        .check(app.store(), ip, app.clock().now_secs())
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(peer = %ip, "Rate limit exceeded");
            Err(IngressError::RateLimited)
        }
        Err(e) => {
            warn!(peer = %ip, error = %e, "Rate limiter unavailable, allowing request");
            Ok(())
        }
    }
}

/// Deduplicates and appends an authenticated envelope.
pub async fn ingest<L, S>(app: &AppState<L, S>, envelope: EventEnvelope) -> Result<Accepted, IngressError>
where
    L: EventLog,
    S: KeyValueStore,
{
    let key = envelope.delivery_id.dedupe_key();
    let first = app
        .store()
        .set_if_absent(&key, app.config().dedupe_ttl)
        .await
        .map_err(|e| {
            error!(delivery_id = %envelope.delivery_id, error = %e, "Idempotency store unavailable");
            IngressError::Store(e)
        })?;

    if !first {
        debug!(delivery_id = %envelope.delivery_id, "Duplicate delivery");
        return Ok(Accepted::Duplicate);
    }

    match app.log().append(&app.config().stream, &envelope.to_fields()).await {
        Ok(entry_id) => {
            info!(
                delivery_id = %envelope.delivery_id,
                entry_id = %entry_id,
                "Webhook accepted"
            );
            Ok(Accepted::Appended(entry_id))
        }
        Err(e) => {
            error!(delivery_id = %envelope.delivery_id, error = %e, "Failed to append webhook");
            if let Err(del) = app.store().delete(&key).await {
                error!(
                    delivery_id = %envelope.delivery_id,
                    error = %del,
                    "Failed to release dedupe key after append failure"
                );
            }
            Err(IngressError::Append(e))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// True for `application/json`, ignoring case and any parameters.
fn is_json_content_type(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

fn delivery_id(headers: &HeaderMap) -> Option<DeliveryId> {
    [HEADER_DELIVERY_ID, HEADER_IDEMPOTENCY_KEY]
        .into_iter()
        .filter_map(|name| header_str(headers, name))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(DeliveryId::from)
}

/// Collects headers with UTF-8 values, lower-cased. Repeated headers are
/// joined with `", "`.
fn extract_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}
