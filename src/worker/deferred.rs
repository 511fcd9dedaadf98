//! Entries the main loop holds back until they are due.
//!
//! A retry copy read before its `next_ts` stays pending in the group and waits
//! here instead of being appended again straight away. It is released once it
//! falls due or once the hold limit passes, whichever is first. The worker keeps
//! the hold limit below the reclaim idle threshold, so the reclaim loop never
//! takes over an entry that is still held.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::eventlog::LogEntry;

/// Shortest wait handed to a blocking read. Redis treats a zero block as
/// "wait forever".
pub const MIN_WAIT: Duration = Duration::from_millis(1);

/// Held entries ordered by release time (unix milliseconds).
#[derive(Debug, Default)]
pub struct DeferredEntries {
    held: BTreeMap<(i64, u64), LogEntry>,
    seq: u64,
}

impl DeferredEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Holds `entry` until `release_at_ms`.
    pub fn hold(&mut self, entry: LogEntry, release_at_ms: i64) {
        self.seq += 1;
        self.held.insert((release_at_ms, self.seq), entry);
    }

    /// The earliest release time, if anything is held.
    pub fn next_release(&self) -> Option<i64> {
        self.held.keys().next().map(|&(at, _)| at)
    }

    /// Removes and returns every entry released at or before `now_ms`, earliest
    /// first.
    pub fn take_released(&mut self, now_ms: i64) -> Vec<LogEntry> {
        let later = self.held.split_off(&(now_ms.saturating_add(1), 0));
        std::mem::replace(&mut self.held, later).into_values().collect()
    }

    /// How long a blocking read may wait: until the next release, capped at
    /// `max`, never less than [`MIN_WAIT`].
    pub fn wait(&self, now_ms: i64, max: Duration) -> Duration {
        let wait = match self.next_release() {
            Some(at) => {
                let millis = u64::try_from(at.saturating_sub(now_ms)).unwrap_or(0);
                Duration::from_millis(millis).min(max)
            }
            None => max,
        };
        wait.max(MIN_WAIT)
    }
}
