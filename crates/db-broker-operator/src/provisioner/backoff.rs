use std::time::Duration;

/// Default delay unit between polling attempts.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Default number of attempts before a polling operation gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Linear backoff: the wait before attempt `k` (1-based) is `base × (k - 1)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinearBackoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl LinearBackoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            // At least one attempt is always made.
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.saturating_sub(1))
    }

    /// Iterates over the attempt numbers `1..=max_attempts`, paired with the delay to wait
    /// before each of them.
    pub fn attempts(&self) -> impl Iterator<Item = (u32, Duration)> + use<> {
        let backoff = *self;
        (1..=backoff.max_attempts).map(move |attempt| (attempt, backoff.delay_before(attempt)))
    }
}
