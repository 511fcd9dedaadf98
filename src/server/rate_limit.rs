//! Fixed-window rate limiting per source IP.
//!
//! Each request increments `ratelimit:<ip>:<window_index>` in the store, where
//! `window_index = now_secs / window_secs`. The key expires with its window, so
//! counting is one atomic round trip and nothing needs cleaning up.

use std::net::IpAddr;
use std::time::Duration;

use crate::store::{KeyValueStore, Result};

pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_RATE_LIMIT_MAX: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub window: Duration,
    /// Requests allowed per window. Zero disables limiting.
    pub max_requests: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            window: DEFAULT_RATE_LIMIT_WINDOW,
            max_requests: DEFAULT_RATE_LIMIT_MAX,
        }
    }
}

impl RateLimit {
    pub fn disabled() -> Self {
        RateLimit {
            max_requests: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX).max(1)
    }

    /// The counter key for `ip` in the window containing `now_secs`.
    pub fn key(&self, ip: IpAddr, now_secs: i64) -> String {
        let window_index = now_secs.div_euclid(self.window_secs());
        format!("ratelimit:{}:{}", ip.to_canonical(), window_index)
    }

    /// Counts one request and returns whether it is within the limit.
    pub async fn check<S: KeyValueStore>(&self, store: &S, ip: IpAddr, now_secs: i64) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        let count = store.incr_with_ttl(&self.key(ip, now_secs), self.window).await?;
        Ok(u64::try_from(count).unwrap_or(0) <= self.max_requests)
    }
}
