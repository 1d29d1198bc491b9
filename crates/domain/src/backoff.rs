//! Capped exponential backoff between acquisition retries.

use std::time::Duration;

use lockwarden_core::{LockError, LockResult};

/// Default first retry delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Default retry delay ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

const JITTER_RESOLUTION: u32 = 1_000;
const JITTER_DIVISOR: u32 = 4;

/// Retry delay schedule for contended acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl BackoffPolicy {
    /// Creates a validated backoff policy.
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> LockResult<Self> {
        if initial.is_zero() {
            return Err(LockError::Validation(
                "initial backoff must be greater than zero".to_owned(),
            ));
        }

        if max < initial {
            return Err(LockError::Validation(
                "max backoff must not be smaller than initial backoff".to_owned(),
            ));
        }

        if multiplier == 0 {
            return Err(LockError::Validation(
                "backoff multiplier must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            initial,
            max,
            multiplier,
        })
    }

    /// Returns the delay ceiling.
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the un-jittered delay before retry number `retry` (zero based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Returns the sleep before retry `retry`, jittered and bounded by `remaining`.
    ///
    /// `jitter_sample` shaves up to a quarter off the delay; the result never
    /// exceeds the cap or the remaining wait budget.
    #[must_use]
    pub fn next_delay(&self, retry: u32, remaining: Duration, jitter_sample: u32) -> Duration {
        let delay = self.delay_for(retry);
        let shave = delay.saturating_mul(jitter_sample % JITTER_RESOLUTION)
            / (JITTER_RESOLUTION * JITTER_DIVISOR);
        delay.saturating_sub(shave).min(remaining)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
            multiplier: 2,
        }
    }
}
