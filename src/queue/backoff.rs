//! Exponential backoff and scheduled requeue.
//!
//! The event log doubles as the delay queue: a retry is a new copy of the
//! envelope appended to the tail with `next_ts` set. The main loop holds a copy
//! it reads too early until it is due; one still early after the hold limit is
//! appended again unchanged. [`ScheduledRequeue`] names both appends so the
//! processor has one path for them.

use std::time::Duration;

use super::envelope::EventEnvelope;

/// Default number of business retries before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff base (5 seconds).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Business-failure retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles with each attempt.
    pub base: Duration,
    /// Retries allowed before `max_attempts` dead-lettering.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: DEFAULT_BACKOFF_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        BackoffPolicy { base, max_attempts }
    }

    /// Delay for an envelope that has already been retried `attempts` times.
    ///
    /// `base * 2^attempts`, saturating at `Duration::MAX`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Decides what happens to `envelope` after its handler failed at `now_ms`.
    pub fn decide(&self, envelope: &EventEnvelope, now_ms: i64) -> RetryDecision {
        if envelope.attempts >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = self.delay_for_attempt(envelope.attempts);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due = now_ms.saturating_add(delay_ms);
        RetryDecision::Requeue(ScheduledRequeue {
            envelope: envelope.retry_copy(due),
            delay,
        })
    }
}

/// Outcome of a business failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Append this copy and acknowledge the original.
    Requeue(ScheduledRequeue),
    /// No retries left.
    Exhausted,
}

/// An envelope to append to the tail of the log for later pickup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRequeue {
    pub envelope: EventEnvelope,
    /// How far in the future the copy becomes due. Zero for deferrals.
    pub delay: Duration,
}

impl ScheduledRequeue {
    /// Re-queues a not-yet-due envelope unchanged.
    pub fn deferred(envelope: EventEnvelope) -> Self {
        ScheduledRequeue {
            envelope,
            delay: Duration::ZERO,
        }
    }

    /// When the copy becomes processable (unix milliseconds).
    pub fn due_at(&self) -> Option<i64> {
        self.envelope.next_ts
    }
}
