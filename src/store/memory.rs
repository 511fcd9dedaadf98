//! In-process TTL map.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with a paused runtime
//! clock can advance past TTLs without sleeping.
//!
//! Expired keys are dropped lazily: a write sweeps the whole map at most once
//! per [`SWEEP_INTERVAL`]. Rate-limit keys are minted per source address and
//! window, so without the sweep the map would only ever grow.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::{KeyValueStore, Result};

/// Minimum time between two sweeps of expired keys.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A [`KeyValueStore`] held entirely in memory.
///
/// Atomicity comes from a single mutex that is never held across an await.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<String, Slot>,
    next_sweep: Option<Instant>,
}

impl State {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before - self.slots.len()
    }

    fn maybe_sweep(&mut self, now: Instant) {
        match self.next_sweep {
            Some(due) if now < due => {}
            Some(_) => {
                self.purge(now);
                self.next_sweep = Some(now + SWEEP_INTERVAL);
            }
            None => self.next_sweep = Some(now + SWEEP_INTERVAL),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.lock()
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value)
    }

    /// Returns `true` if `key` is present and not expired.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Drops every expired key now. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.lock().purge(Instant::now())
    }

    /// Number of keys held, including expired keys not yet swept.
    pub fn stored_len(&self) -> usize {
        self.lock().slots.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned map is still structurally valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        state.maybe_sweep(now);
        let slots = &mut state.slots;

        if slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }

        slots.insert(
            key.to_string(),
            Slot {
                value: 1,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut state = self.lock();
        state.maybe_sweep(now);
        let slots = &mut state.slots;

        let previous = slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map_or(0, |slot| slot.value);
        let value = previous.saturating_add(1);

        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn set_if_absent_only_sets_once() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("dedupe:a", HOUR).await.unwrap());
        assert!(!store.set_if_absent("dedupe:a", HOUR).await.unwrap());
        assert!(store.set_if_absent("dedupe:b", HOUR).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_succeeds_again_after_expiry() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent("dedupe:a", HOUR).await.unwrap());
        tokio::time::advance(HOUR + Duration::from_secs(1)).await;

        assert!(!store.contains("dedupe:a"));
        assert!(store.set_if_absent("dedupe:a", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_from_one() {
        let store = MemoryStore::new();

        assert_eq!(store.incr_with_ttl("retry:1-0", HOUR).await.unwrap(), 1);
        assert_eq!(store.incr_with_ttl("retry:1-0", HOUR).await.unwrap(), 2);
        assert_eq!(store.incr_with_ttl("retry:1-0", HOUR).await.unwrap(), 3);
        assert_eq!(store.get("retry:1-0"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn incr_restarts_after_expiry() {
        let store = MemoryStore::new();

        store.incr_with_ttl("retry:1-0", HOUR).await.unwrap();
        store.incr_with_ttl("retry:1-0", HOUR).await.unwrap();
        tokio::time::advance(HOUR * 2).await;

        assert_eq!(store.incr_with_ttl("retry:1-0", HOUR).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_key_and_tolerates_missing() {
        let store = MemoryStore::new();

        store.set_if_absent("dedupe:a", HOUR).await.unwrap();
        store.delete("dedupe:a").await.unwrap();
        store.delete("dedupe:never").await.unwrap();

        assert!(!store.contains("dedupe:a"));
        assert!(store.set_if_absent("dedupe:a", HOUR).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_drops_only_dead_keys() {
        let store = MemoryStore::new();

        store
            .set_if_absent("short", Duration::from_secs(1))
            .await
            .unwrap();
        store.set_if_absent("long", HOUR).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), 1);
        assert!(store.contains("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_keys() {
        let store = MemoryStore::new();

        for window in 0..3 {
            store
                .incr_with_ttl(&format!("ratelimit:10.0.0.1:{window}"), Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(store.stored_len(), 3);

        // Still inside the first sweep interval: nothing is dropped yet.
        tokio::time::advance(Duration::from_secs(2)).await;
        store.set_if_absent("dedupe:a", HOUR).await.unwrap();
        assert_eq!(store.stored_len(), 4);

        tokio::time::advance(SWEEP_INTERVAL).await;
        store.set_if_absent("dedupe:b", HOUR).await.unwrap();

        assert_eq!(store.stored_len(), 2);
        assert!(store.contains("dedupe:a"));
        assert!(store.contains("dedupe:b"));
    }
}
