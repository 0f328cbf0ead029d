//! Bounded retry for the "device or resource busy" failure class.
//!
//! The kernel briefly holds device nodes busy after partition rescans and
//! mount table changes. Helpers that trip over this are retried a small,
//! fixed number of times with a short sleep; anything still failing after
//! the budget is spent is reclassified and surfaced as fatal. The budget
//! is one reviewed policy (`RetryPolicy::busy`), not a per-call-site
//! guess.

use std::time::Duration;

use imglift_shared::constants::binder;
use imglift_shared::errors::{MigrateError, MigrateResult};
use rand::Rng;

/// Linear retry policy with optional jitter.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// The reviewed policy for the busy class: 3 attempts, 1 s apart,
    /// with ±10% jitter so parallel runs do not retry in lockstep.
    pub fn busy() -> Self {
        Self {
            max_attempts: binder::BUSY_RETRY_ATTEMPTS,
            delay: Duration::from_millis(binder::BUSY_RETRY_DELAY_MS),
            jitter_fraction: 0.1,
        }
    }

    /// Policy with explicit attempt count and delay, no jitter.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            jitter_fraction: 0.0,
        }
    }

    /// Run `op`, retrying busy-class failures until the budget is spent.
    ///
    /// Non-busy errors propagate immediately. A busy failure that survives
    /// every attempt is reclassified as `MigrateError::Transient`, which
    /// the pipeline treats as fatal-with-cleanup like any resource error.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> MigrateResult<T>
    where
        F: FnMut() -> MigrateResult<T>,
    {
        let mut last_busy = None;
        for attempt in 1..=self.max_attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "busy, will retry"
                    );
                    last_busy = Some(err);
                    if attempt < self.max_attempts {
                        std::thread::sleep(self.jittered_delay());
                    }
                }
                Err(err) => return Err(err),
            }
        }
        // Budget exhausted; reclassify so callers handle it as fatal.
        let last = last_busy.map(|e| e.to_string()).unwrap_or_default();
        Err(MigrateError::Transient(format!(
            "{} still busy after {} attempts: {}",
            what, self.max_attempts, last
        )))
    }

    fn jittered_delay(&self) -> Duration {
        if self.delay.is_zero() || self.jitter_fraction <= 0.0 {
            return self.delay;
        }
        let fraction = self.jitter_fraction.min(1.0);
        let factor = rand::rng().random_range(1.0 - fraction..=1.0 + fraction);
        Duration::from_millis((self.delay.as_millis() as f64 * factor).round() as u64)
    }
}
