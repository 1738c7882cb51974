use std::time::Duration;

/// Upper bound on any retry delay of the poll loop.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(90);

/// Exponential backoff used between failed polls: `min(cap, e^(failures / 2))` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay after `failures` consecutive errors, honoring a server retry hint
    /// when it is longer. Never exceeds the cap.
    pub fn delay_for_failures(&self, failures: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponential = (f64::from(failures) / 2.0).exp().min(cap);
        let hinted = retry_after_hint_ms.map_or(0.0, |ms| ms as f64 / 1000.0);
        Duration::from_secs_f64(exponential.max(hinted).min(cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKOFF)
    }
}
