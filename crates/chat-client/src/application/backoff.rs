//! Reconnect backoff schedule.
//!
//! | attempt | delay                       |
//! |---------|-----------------------------|
//! | 1       | 0 (immediate)               |
//! | 2       | `base`                      |
//! | n ≥ 3   | `base × 2^(n-2)`, capped    |
//!
//! The cap is the configured maximum, itself never above [`MAX_BACKOFF`].

use std::time::Duration;

/// Hard ceiling on any single reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay before reconnect `attempt` (1-indexed).
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let cap = max.min(MAX_BACKOFF);
    match attempt {
        0 | 1 => Duration::ZERO,
        n => 2u32
            .checked_pow(n - 2)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(cap, |delay| delay.min(cap)),
    }
}

/// Reconnect settings resolved from the client config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed after a failure before giving up.  `0` disables
    /// automatic reconnection.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }

    /// `true` while `attempt` is within the attempt budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: MAX_BACKOFF,
            max_attempts: 10,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
