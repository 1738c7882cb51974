use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::DEFAULT_MAX_BACKOFF;

/// Tuning knobs for the poll loop and the reload coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server-side long-poll timeout; the request timeout adds `poll_timeout_slack`.
    pub poll_timeout: Duration,
    pub poll_timeout_slack: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures before the connection error becomes visible.
    pub failures_before_error: u32,
    pub watchdog_period: Duration,
    /// Gap between watchdog samples that counts as a suspended process.
    pub suspend_threshold: Duration,
    pub reload_idle_timeout: Duration,
    pub reload_composing_idle_timeout: Duration,
    /// Unconditional wait before a pending reload is forced.
    pub reload_max_wait: Duration,
    pub reload_max_jitter: Duration,
}

impl SyncConfig {
    /// Timeout for a single long-poll request.
    pub fn request_timeout(&self) -> Duration {
        self.poll_timeout + self.poll_timeout_slack
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(90),
            poll_timeout_slack: Duration::from_secs(10),
            max_backoff: DEFAULT_MAX_BACKOFF,
            failures_before_error: 5,
            watchdog_period: Duration::from_secs(5),
            suspend_threshold: Duration::from_secs(20),
            reload_idle_timeout: Duration::from_secs(60),
            reload_composing_idle_timeout: Duration::from_secs(7 * 60),
            reload_max_wait: Duration::from_secs(30 * 60),
            reload_max_jitter: Duration::from_secs(5 * 60),
        }
    }
}
