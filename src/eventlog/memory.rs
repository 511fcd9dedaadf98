//! In-process consumer-group log.
//!
//! Mirrors the subset of Redis Streams semantics the worker relies on: ids are
//! `<seq>-0`, groups start from the beginning of the stream, entries read by a
//! group stay pending until acknowledged, and idle pending entries can be
//! claimed by another consumer. Idle time is measured with
//! `tokio::time::Instant` so tests can drive it with a paused clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{EventLog, Fields, LogEntry, LogError, Result};
use crate::types::EntryId;

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, Fields>,
    last_seq: u64,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Group {
    /// Highest sequence number handed out by `read_group`.
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Clone)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

/// An [`EventLog`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
}

fn format_id(seq: u64) -> EntryId {
    EntryId::new(format!("{seq}-0"))
}

fn parse_id(id: &EntryId) -> Option<u64> {
    let raw = id.as_str();
    raw.split_once('-').map_or(raw, |(seq, _)| seq).parse().ok()
}

fn to_entry(seq: u64, fields: &Fields) -> LogEntry {
    LogEntry::new(format_id(seq), fields.iter().cloned().collect())
}

fn no_group(stream: &str, group: &str) -> LogError {
    LogError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every entry currently in `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<LogEntry> {
        self.lock()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(&seq, fields)| to_entry(seq, fields))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of entries in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    /// Returns `true` if `stream` has no entries.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Returns the number of unacknowledged entries for `group`.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Returns the consumer currently owning a pending entry and how many times
    /// it has been delivered.
    pub fn pending_owner(&self, stream: &str, group: &str, id: &EntryId) -> Option<(String, u64)> {
        let seq = parse_id(id)?;
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(&seq))
            .map(|p| (p.consumer.clone(), p.delivery_count))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut batch = Vec::new();
        for (&seq, fields) in s.entries.range(g.last_delivered + 1..).take(count.max(1)) {
            g.pending.insert(
                seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            g.last_delivered = seq;
            batch.push(to_entry(seq, fields));
        }
        Ok(batch)
    }
}

impl EventLog for MemoryEventLog {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, Vec<u8>)]) -> Result<EntryId> {
        let id = {
            let mut streams = self.lock();
            let s = streams.entry(stream.to_string()).or_default();
            s.last_seq += 1;
            s.entries.insert(s.last_seq, fields.to_vec());
            format_id(s.last_seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking, so an append between the look
            // and the wait still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let idle: Vec<u64> = g
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(&seq, _)| seq)
            .take(count.max(1))
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for seq in idle {
            // Entries deleted from the stream are dropped from the pending list.
            let Some(fields) = s.entries.get(&seq) else {
                g.pending.remove(&seq);
                continue;
            };
            if let Some(pending) = g.pending.get_mut(&seq) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.delivery_count += 1;
                claimed.push(to_entry(seq, fields));
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &EntryId) -> Result<()> {
        let Some(seq) = parse_id(id) else {
            return Ok(());
        };
        if let Some(g) = self
            .lock()
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pending.remove(&seq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::field_pair;
    use std::sync::Arc;

    const STREAM: &str = "webhooks";
    const GROUP: &str = "workers";

    fn fields(n: u32) -> Fields {
        vec![field_pair("n", n.to_string())]
    }

    async fn log_with_group() -> MemoryEventLog {
        let log = MemoryEventLog::new();
        log.ensure_group(STREAM, GROUP).await.unwrap();
        log
    }

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let log = MemoryEventLog::new();
        let a = log.append(STREAM, &fields(1)).await.unwrap();
        let b = log.append(STREAM, &fields(2)).await.unwrap();

        assert_eq!(a.as_str(), "1-0");
        assert_eq!(b.as_str(), "2-0");
        assert_eq!(log.len(STREAM), 2);
    }

    #[tokio::test]
    async fn read_group_without_group_fails() {
        let log = MemoryEventLog::new();
        log.append(STREAM, &fields(1)).await.unwrap();

        let result = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(LogError::NoGroup { .. })));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let log = log_with_group().await;
        log.append(STREAM, &fields(1)).await.unwrap();
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        log.ensure_group(STREAM, GROUP).await.unwrap();

        // Re-creating must not rewind delivery.
        let again = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn read_group_delivers_each_entry_once() {
        let log = log_with_group().await;
        for n in 0..3 {
            log.append(STREAM, &fields(n)).await.unwrap();
        }

        let first = log
            .read_group(STREAM, GROUP, "c1", 2, Duration::ZERO)
            .await
            .unwrap();
        let second = log
            .read_group(STREAM, GROUP, "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        let third = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].field("n"), Some("0"));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].field("n"), Some("2"));
        assert!(third.is_empty());
        assert_eq!(log.pending_count(STREAM, GROUP), 3);
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let log = log_with_group().await;
        let id = log.append(STREAM, &fields(1)).await.unwrap();
        log.read_group(STREAM, GROUP, "c1", 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(log.pending_owner(STREAM, GROUP, &id), Some(("c1".to_string(), 1)));
        log.ack(STREAM, GROUP, &id).await.unwrap();
        assert_eq!(log.pending_count(STREAM, GROUP), 0);

        // Acking twice is harmless.
        log.ack(STREAM, GROUP, &id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_append() {
        let log = Arc::new(log_with_group().await);

        let reader = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                log.read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        log.append(STREAM, &fields(7)).await.unwrap();

        let batch = reader.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].field("n"), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_times_out_empty() {
        let log = log_with_group().await;
        let started = Instant::now();

        let batch = log
            .read_group(STREAM, GROUP, "c1", 10, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_claim_only_takes_idle_entries() {
        let log = log_with_group().await;
        let id = log.append(STREAM, &fields(1)).await.unwrap();
        log.read_group(STREAM, GROUP, "crashed", 1, Duration::ZERO)
            .await
            .unwrap();

        let early = log
            .auto_claim(STREAM, GROUP, "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;

        let claimed = log
            .auto_claim(STREAM, GROUP, "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(
            log.pending_owner(STREAM, GROUP, &id),
            Some(("rescuer".to_string(), 2))
        );

        // Claiming resets the idle clock.
        let again = log
            .auto_claim(STREAM, GROUP, "other", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn auto_claim_respects_count() {
        let log = log_with_group().await;
        for n in 0..5 {
            log.append(STREAM, &fields(n)).await.unwrap();
        }
        log.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let claimed = log
            .auto_claim(STREAM, GROUP, "c2", Duration::ZERO, 2)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].field("n"), Some("0"));
    }
}
