//! Per-key exponential backoff.

use std::time::Duration;

use rustc_hash::FxHashMap;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// `base * 2^failures`, capped at `max`. Failures are counted per key until [`forget`](Self::forget).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: FxHashMap<String, u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, failures: FxHashMap::default() } }

    /// Record a failure of `key` and return how long to wait before retrying it.
    pub fn when(&mut self, key: &str) -> Duration {
        let n = self.failures.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map_or(self.max, |d| d.min(self.max))
    }

    pub fn forget(&mut self, key: &str) { self.failures.remove(key); }

    pub fn retries(&self, key: &str) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}
