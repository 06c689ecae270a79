use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Read-only CHAOS commands. Only these are retried.
pub const IDEMPOTENT_COMMANDS: &[&str] = &["services", "info", "usage", "quota", "ratecard"];

pub fn is_idempotent(command: &str) -> bool {
    IDEMPOTENT_COMMANDS.contains(&command)
}

/// Retry allowance shared by every call made during one collection cycle.
///
/// Once any call ends in `RateLimited`, later calls under the same budget
/// get no retries.
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    throttled: Arc<AtomicBool>,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    pub fn mark_throttled(&self) {
        self.throttled.store(true, Ordering::Release);
    }

    pub(crate) fn retries(&self, configured: u32) -> u32 {
        if self.is_throttled() {
            0
        } else {
            configured
        }
    }
}

/// Capped exponential backoff with equal jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Upper bound for the delay after the zero-based `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }

    /// Half the ceiling plus a uniform share of the other half.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_micros()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        half + Duration::from_micros(jitter)
    }
}
