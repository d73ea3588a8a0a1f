//! Per-object exponential backoff for failed reconciles
//!
//! `kube::runtime::Controller` calls `error_policy` with the failed object
//! but keeps no retry count, so the count lives here keyed by pod UID. A
//! successful reconcile resets it.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

/// First retry delay after a failure
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound on the retry delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Failure counters keyed by object
#[derive(Debug)]
pub struct ErrorBackoff {
    failures: DashMap<String, u32>,
    base: Duration,
    max: Duration,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

impl ErrorBackoff {
    /// Create a tracker with the given base and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base,
            max,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    ///
    /// The delay doubles per consecutive failure up to the cap, then gets
    /// 0.5x to 1.5x jitter so pods failing together do not retry together.
    pub fn next_delay(&self, key: &str) -> Duration {
        let attempt = {
            let mut count = self.failures.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.delay_for_attempt(attempt).as_secs_f64() * jitter)
    }

    /// Un-jittered delay for the n-th consecutive failure (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget failures for `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |c| *c)
    }
}
