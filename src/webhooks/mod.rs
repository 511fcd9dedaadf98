//! Inbound webhook authentication.
//!
//! This module provides signature verification for webhook payloads
//! (HMAC-SHA256, current and legacy schemes, secret rotation).

pub mod signature;

pub use signature::{
    REPLAY_WINDOW_SECS, SignatureHeaders, compute_signature, compute_v2_signature,
    format_signature_header, parse_signature_header, verify_any, verify_legacy, verify_v2,
};
