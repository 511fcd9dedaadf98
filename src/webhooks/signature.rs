//! Webhook signature verification using HMAC-SHA256.
//!
//! Two schemes are accepted, both carrying the signature as `sha256=<hex>`:
//!
//! - **v2** signs `"<timestamp>.<raw_body>"` and sends the unix-seconds timestamp
//!   in its own header. Deliveries whose timestamp is more than
//!   [`REPLAY_WINDOW_SECS`] away from the receiver's clock are rejected even when
//!   the signature is correct.
//! - **legacy** signs the raw body alone and has no freshness check.
//!
//! Verification always runs on the untouched request bytes. Re-serializing the
//! JSON before verifying would change the bytes and invalidate the signature.
//! Every secret in the rotation set is tried; any match accepts.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed distance between a v2 timestamp and the current time.
pub const REPLAY_WINDOW_SECS: u64 = 300;

/// Signature-related header values extracted from a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureHeaders<'a> {
    /// Unix-seconds timestamp for the v2 scheme.
    pub timestamp: Option<&'a str>,
    /// `sha256=<hex>` signature for the v2 scheme.
    pub signature: Option<&'a str>,
    /// `sha256=<hex>` signature for the legacy scheme.
    pub legacy_signature: Option<&'a str>,
}

/// Parses a signature header (e.g., "sha256=abc123...") into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex, etc.).
/// Never panics.
///
/// # Examples
///
/// ```
/// use webhook_ingest::webhooks::parse_signature_header;
///
/// assert!(parse_signature_header("sha256=abcd1234").is_some());
/// assert!(parse_signature_header("abcd1234").is_none());
/// assert!(parse_signature_header("sha1=abcd1234").is_none());
/// assert!(parse_signature_header("sha256=xyz").is_none());
/// ```
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the legacy HMAC-SHA256 signature of a payload.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Computes the v2 HMAC-SHA256 signature over `"<timestamp>.<payload>"`.
pub fn compute_v2_signature(timestamp: &str, payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a header value of the form "sha256=<hex>".
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a v2 signature.
///
/// Returns `false` when either header is missing, the timestamp is not an
/// integer, the timestamp is outside the replay window around `now_secs`, or the
/// signature does not match.
///
/// # Examples
///
/// ```
/// use webhook_ingest::webhooks::{compute_v2_signature, format_signature_header, verify_v2};
///
/// let body = br#"{"event":"ping"}"#;
/// let sig = format_signature_header(&compute_v2_signature("1700000000", body, b"s3cret"));
///
/// assert!(verify_v2(body, Some("1700000000"), Some(&sig), b"s3cret", 1_700_000_100));
/// assert!(!verify_v2(body, Some("1700000000"), Some(&sig), b"s3cret", 1_700_000_301));
/// ```
pub fn verify_v2(
    payload: &[u8],
    timestamp: Option<&str>,
    signature_header: Option<&str>,
    secret: &[u8],
    now_secs: i64,
) -> bool {
    let (Some(timestamp), Some(signature_header)) = (timestamp, signature_header) else {
        return false;
    };

    let Ok(claimed) = timestamp.parse::<i64>() else {
        return false;
    };

    if now_secs.abs_diff(claimed) > REPLAY_WINDOW_SECS {
        return false;
    }

    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    // Constant-time; a length mismatch fails without comparing bytes.
    mac.verify_slice(&expected).is_ok()
}

/// Verifies a legacy signature over the raw payload.
///
/// There is no timestamp check: arbitrarily old deliveries verify.
pub fn verify_legacy(payload: &[u8], signature_header: Option<&str>, secret: &[u8]) -> bool {
    let Some(expected) = signature_header.and_then(parse_signature_header) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&expected).is_ok()
}

/// Verifies a request against every configured secret.
///
/// The v2 scheme is tried first across all secrets, then the legacy scheme. The
/// legacy scheme reads the legacy header, falling back to the v2 signature
/// header for senders that only send one signature.
pub fn verify_any<S: AsRef<[u8]>>(
    payload: &[u8],
    headers: &SignatureHeaders<'_>,
    secrets: &[S],
    now_secs: i64,
) -> bool {
    let v2 = secrets.iter().any(|secret| {
        verify_v2(
            payload,
            headers.timestamp,
            headers.signature,
            secret.as_ref(),
            now_secs,
        )
    });
    if v2 {
        return true;
    }

    let legacy_header = headers.legacy_signature.or(headers.signature);
    secrets
        .iter()
        .any(|secret| verify_legacy(payload, legacy_header, secret.as_ref()))
}
