//! Reconnection delay policy.

use rand::Rng;
use std::time::Duration;

/// Default base delay before the first reconnect attempt.
pub const BASE_DELAY: Duration = Duration::from_millis(500);
/// Default upper bound on the random jitter added to each delay.
pub const JITTER_MAX: Duration = Duration::from_millis(200);
/// Default cap on any single delay.
pub const MAX_DELAY: Duration = Duration::from_secs(30);
/// Reconnect attempts before giving up on a subscription.
pub const MAX_RETRIES: u32 = 8;

/// Exponential backoff with jitter: `min(base * 2^attempt + jitter, cap)`.
///
/// Pure up to the jitter term; holds no counter of its own, so the caller
/// decides what "attempt" means (it resets to 0 on a successful connect).
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            jitter: JITTER_MAX,
            cap: MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before reconnect attempt number `attempt` (0-based).
    ///
    /// Saturates instead of overflowing, so any attempt value is safe even
    /// though the connection manager stops at [`MAX_RETRIES`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(self.cap)
    }
}
