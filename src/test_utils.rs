//! Shared test doubles and request builders.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;

use crate::eventlog::{EventLog, LogEntry, LogError, MemoryEventLog, Result as LogResult};
use crate::queue::{EventEnvelope, WebhookEvent};
use crate::store::{KeyValueStore, MemoryStore, Result as StoreResult, StoreError};
use crate::types::{DeliveryId, EntryId};
use crate::webhooks::{compute_signature, compute_v2_signature, format_signature_header};
use crate::worker::{EventHandler, HandlerError};

pub const TEST_SECRET: &[u8] = b"test-secret";

// ─── Handlers ───

#[derive(Debug)]
enum Step {
    Fail(String),
    Panic,
}

/// A handler whose results are scripted in advance. Once the script runs out
/// every call succeeds. Records `(delivery_id, attempts)` for each call.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    always_fail: AtomicBool,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Fails the first `n` calls.
    pub fn failing_times(n: usize) -> Self {
        let handler = Self::default();
        {
            let mut script = handler.script.lock().unwrap();
            for i in 0..n {
                script.push_back(Step::Fail(format!("scripted failure {}", i + 1)));
            }
        }
        handler
    }

    /// Panics on the first `n` calls.
    pub fn panicking_times(n: usize) -> Self {
        let handler = Self::default();
        handler
            .script
            .lock()
            .unwrap()
            .extend((0..n).map(|_| Step::Panic));
        handler
    }

    pub fn always_failing() -> Self {
        let handler = Self::default();
        handler.always_fail.store(true, Ordering::SeqCst);
        handler
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl EventHandler for ScriptedHandler {
    async fn handle(&self, _event: &WebhookEvent, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        self.calls
            .lock()
            .unwrap()
            .push((envelope.delivery_id.to_string(), envelope.attempts));

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(HandlerError::new("always failing"));
        }
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(message)) => Err(HandlerError::new(message)),
            Some(Step::Panic) => panic!("scripted panic for {}", envelope.delivery_id),
            None => Ok(()),
        }
    }
}

// ─── Fault injection ───

/// An in-memory log that can be told to fail its next operations.
#[derive(Debug, Default)]
pub struct FaultyLog {
    pub inner: MemoryEventLog,
    fail_acks: AtomicUsize,
    fail_appends: AtomicUsize,
    fail_reads: AtomicUsize,
}

fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> LogError {
    LogError::Unavailable("injected fault".to_string())
}

impl FaultyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_acks(&self, n: usize) {
        self.fail_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }
}

impl EventLog for FaultyLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> LogResult<()> {
        self.inner.ensure_group(stream, group).await
    }

    async fn append(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> LogResult<EntryId> {
        if take_fault(&self.fail_appends) {
            return Err(injected());
        }
        self.inner.append(stream, fields).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> LogResult<Vec<LogEntry>> {
        if take_fault(&self.fail_reads) {
            return Err(injected());
        }
        self.inner.read_group(stream, group, consumer, count, block).await
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> LogResult<Vec<LogEntry>> {
        self.inner.auto_claim(stream, group, consumer, min_idle, count).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> LogResult<()> {
        if take_fault(&self.fail_acks) {
            return Err(injected());
        }
        self.inner.ack(stream, group, id).await
    }
}

/// An in-memory store that can be switched into a failing state.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    down: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for FaultyStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, ttl).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.check()?;
        self.inner.incr_with_ttl(key, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}

// ─── Envelopes ───

pub fn event_payload(event: &str) -> String {
    serde_json::json!({ "event": event, "data": { "n": 1 } }).to_string()
}

pub fn make_envelope(delivery_id: &str, payload: &str) -> EventEnvelope {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    EventEnvelope::new(DeliveryId::new(delivery_id), 1_700_000_000_000, headers, payload)
}

// ─── Requests ───

pub fn peer(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), 40000)
}

/// Builder for `POST /webhook` requests.
pub struct WebhookRequest {
    body: Vec<u8>,
    delivery_id: Option<String>,
    id_header: &'static str,
    content_type: Option<String>,
    timestamp: i64,
    secret: Vec<u8>,
    signature: Option<String>,
    legacy: bool,
    peer: SocketAddr,
}

impl WebhookRequest {
    /// A correctly signed v2 request at `timestamp` (unix seconds).
    pub fn new(delivery_id: &str, body: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        WebhookRequest {
            body: body.into(),
            delivery_id: Some(delivery_id.to_string()),
            id_header: "x-webhook-id",
            content_type: Some("application/json".to_string()),
            timestamp,
            secret: TEST_SECRET.to_vec(),
            signature: None,
            legacy: false,
            peer: peer("127.0.0.1"),
        }
    }

    pub fn secret(mut self, secret: &[u8]) -> Self {
        self.secret = secret.to_vec();
        self
    }

    pub fn signature(mut self, header: impl Into<String>) -> Self {
        self.signature = Some(header.into());
        self
    }

    /// Signs with the legacy body-only scheme under `x-hub-signature-256`.
    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    pub fn without_delivery_id(mut self) -> Self {
        self.delivery_id = None;
        self
    }

    pub fn idempotency_key_header(mut self) -> Self {
        self.id_header = "idempotency-key";
        self
    }

    pub fn content_type(mut self, value: Option<&str>) -> Self {
        self.content_type = value.map(str::to_string);
        self
    }

    pub fn from_ip(mut self, ip: &str) -> Self {
        self.peer = peer(ip);
        self
    }

    pub fn build(self) -> Request<Body> {
        let timestamp = self.timestamp.to_string();
        let mut builder = Request::builder().method("POST").uri("/webhook");

        if let Some(content_type) = &self.content_type {
            builder = builder.header("content-type", content_type);
        }
        if let Some(id) = &self.delivery_id {
            builder = builder.header(self.id_header, id);
        }

        if self.legacy {
            let header = self.signature.clone().unwrap_or_else(|| {
                format_signature_header(&compute_signature(&self.body, &self.secret))
            });
            builder = builder.header("x-hub-signature-256", header);
        } else {
            let header = self.signature.clone().unwrap_or_else(|| {
                format_signature_header(&compute_v2_signature(&timestamp, &self.body, &self.secret))
            });
            builder = builder
                .header("x-webhook-timestamp", &timestamp)
                .header("x-webhook-signature", header);
        }

        let mut request = builder.body(Body::from(self.body)).unwrap();
        request.extensions_mut().insert(ConnectInfo(self.peer));
        request
    }
}
