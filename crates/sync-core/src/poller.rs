//! Long-poll protocol state machine.
//!
//! The poller owns the resume cursor and decides when to poll, back off, give up
//! or force a reconnect. It never touches the network: every decision comes
//! back as a list of [`PollerAction`]s for the runtime to carry out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    error::{SyncError, SyncErrorCategory, classify_http_status},
    retry::RetryPolicy,
};

/// Error code the server uses for a garbage-collected event queue.
pub const BAD_EVENT_QUEUE_ID: &str = "BAD_EVENT_QUEUE_ID";

/// Resume position in the server's event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCursor {
    pub queue_id: String,
    /// `-1` until the first event has been seen.
    pub last_event_id: i64,
}

impl PollCursor {
    pub fn new(queue_id: impl Into<String>, last_event_id: i64) -> Self {
        Self {
            queue_id: queue_id.into(),
            last_event_id,
        }
    }

    /// Move forward to `event_id`; never moves backwards.
    pub fn advance_to(&mut self, event_id: u64) {
        let event_id = i64::try_from(event_id).unwrap_or(i64::MAX);
        if event_id > self.last_event_id {
            self.last_event_id = event_id;
        }
    }
}

/// Parameters of one `GET /json/events` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub queue_id: String,
    pub last_event_id: i64,
    pub dont_block: bool,
    pub timeout: Duration,
}

/// Classified outcome of a failed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// No response within the server's own idle timeout; same as an empty batch.
    Timeout,
    /// We cancelled the request ourselves.
    Aborted,
    /// The server no longer knows our queue.
    QueueExpired,
    /// Anything else; retried with backoff.
    Transient(SyncError),
}

impl PollFailure {
    /// Classify a non-success HTTP response.
    pub fn from_response(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        if status == 400 && response_code(body).as_deref() == Some(BAD_EVENT_QUEUE_ID) {
            return Self::QueueExpired;
        }

        let mut error = SyncError::new(
            classify_http_status(status),
            "poll_http_error",
            format!("poll failed with HTTP {status}: {}", truncate(body, 200)),
        );
        if let Some(retry_after) = retry_after {
            error = error.with_retry_after(retry_after);
        }
        Self::Transient(error)
    }

    /// Transport-level failure (connection refused, reset, DNS, ...).
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient(SyncError::new(
            SyncErrorCategory::TransientNetwork,
            "poll_network_error",
            message,
        ))
    }
}

fn response_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("code")?.as_str().map(ToOwned::to_owned)
}

fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerState {
    Idle,
    Polling,
    Backoff,
    /// Queue expired server-side; only a reload recovers.
    Expired,
    /// A reload is in progress; nothing polls any more.
    Stopped,
}

/// Side effects requested by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerAction {
    IssuePoll(PollRequest),
    /// Cancel the outstanding request before anything else happens.
    AbortOutstanding,
    ScheduleRetry { delay: Duration },
    CancelRetry,
    ShowConnectionError { failures: u32 },
    ClearConnectionError,
    QueueExpired,
}

/// Single-outstanding-request long-poll state machine.
#[derive(Debug, Clone)]
pub struct EventPoller {
    state: PollerState,
    cursor: PollCursor,
    policy: RetryPolicy,
    request_timeout: Duration,
    failures_before_error: u32,
    suspend_threshold_ms: u64,
    failures: u32,
    outstanding: bool,
    error_visible: bool,
    reload_in_progress: bool,
    cleanup_fired: bool,
    last_watchdog_sample_ms: Option<u64>,
}

impl EventPoller {
    pub fn new(cursor: PollCursor, config: &SyncConfig) -> Self {
        Self {
            state: PollerState::Idle,
            cursor,
            policy: RetryPolicy::new(config.max_backoff),
            request_timeout: config.request_timeout(),
            failures_before_error: config.failures_before_error.max(1),
            suspend_threshold_ms: config.suspend_threshold.as_millis() as u64,
            failures: 0,
            outstanding: false,
            error_visible: false,
            reload_in_progress: false,
            cleanup_fired: false,
            last_watchdog_sample_ms: None,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cursor(&self) -> &PollCursor {
        &self.cursor
    }

    /// Consecutive non-timeout failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn has_outstanding_request(&self) -> bool {
        self.outstanding
    }

    pub fn is_error_visible(&self) -> bool {
        self.error_visible
    }

    /// Begin polling. Valid exactly once, from `Idle`.
    pub fn start(&mut self) -> Result<Vec<PollerAction>, SyncError> {
        if self.state != PollerState::Idle {
            return Err(SyncError::invalid_state(self.state, "start"));
        }
        info!(
            queue_id = %self.cursor.queue_id,
            last_event_id = self.cursor.last_event_id,
            "starting event poller"
        );
        Ok(self.issue(false))
    }

    /// Record a successful response before its events are applied.
    ///
    /// Advances the cursor to `max_event_id` and resets the failure count.
    pub fn record_success(&mut self, max_event_id: Option<u64>) -> Vec<PollerAction> {
        let mut actions = Vec::new();
        if self.reload_in_progress || self.state == PollerState::Expired {
            return actions;
        }
        self.outstanding = false;
        if let Some(max_event_id) = max_event_id {
            self.cursor.advance_to(max_event_id);
        }
        if self.failures > 0 {
            debug!(failures = self.failures, "poll recovered");
        }
        self.failures = 0;
        if self.error_visible {
            self.error_visible = false;
            actions.push(PollerAction::ClearConnectionError);
        }
        actions
    }

    /// Issue the follow-up poll after a batch has been applied.
    pub fn poll_again(&mut self) -> Vec<PollerAction> {
        if self.state != PollerState::Polling || self.outstanding {
            return Vec::new();
        }
        self.issue(false)
    }

    /// Handle a failed or cancelled request.
    pub fn record_failure(&mut self, failure: PollFailure) -> Vec<PollerAction> {
        if self.reload_in_progress {
            debug!(?failure, "ignoring poll failure during reload");
            return Vec::new();
        }

        match failure {
            PollFailure::Aborted => {
                debug!("outstanding poll aborted");
                self.outstanding = false;
                Vec::new()
            }
            PollFailure::Timeout => {
                debug!("poll timed out, treating as empty batch");
                let mut actions = self.record_success(None);
                actions.extend(self.poll_again());
                actions
            }
            PollFailure::QueueExpired => {
                warn!(queue_id = %self.cursor.queue_id, "event queue expired on the server");
                self.outstanding = false;
                self.state = PollerState::Expired;
                vec![PollerAction::QueueExpired]
            }
            PollFailure::Transient(error) => {
                self.outstanding = false;
                self.failures = self.failures.saturating_add(1);
                let delay = self
                    .policy
                    .delay_for_failures(self.failures, error.retry_after_ms);
                self.state = PollerState::Backoff;
                warn!(
                    failures = self.failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "poll failed, backing off"
                );

                let mut actions = Vec::new();
                if self.failures >= self.failures_before_error && !self.error_visible {
                    self.error_visible = true;
                    actions.push(PollerAction::ShowConnectionError {
                        failures: self.failures,
                    });
                }
                actions.push(PollerAction::ScheduleRetry { delay });
                actions
            }
        }
    }

    /// The backoff delay elapsed.
    pub fn retry_elapsed(&mut self) -> Vec<PollerAction> {
        if self.state != PollerState::Backoff || self.reload_in_progress {
            debug!(state = ?self.state, "stale retry timer ignored");
            return Vec::new();
        }
        self.issue(false)
    }

    /// Abort whatever is in flight and poll again right away.
    ///
    /// `dont_block` asks the server to answer immediately and resets the
    /// failure count.
    pub fn restart(&mut self, dont_block: bool) -> Vec<PollerAction> {
        if matches!(
            self.state,
            PollerState::Idle | PollerState::Expired | PollerState::Stopped
        ) {
            debug!(state = ?self.state, "restart ignored");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state == PollerState::Backoff {
            actions.push(PollerAction::CancelRetry);
        }
        if dont_block {
            self.failures = 0;
        }
        actions.extend(self.issue(dont_block));
        actions
    }

    /// Wall-clock sample from the suspend watchdog.
    ///
    /// A gap above the suspend threshold means the process slept; reconnect
    /// immediately whatever the backoff state.
    pub fn watchdog_sample(&mut self, now_ms: u64) -> Vec<PollerAction> {
        let previous = self.last_watchdog_sample_ms.replace(now_ms);
        let Some(previous) = previous else {
            return Vec::new();
        };
        let gap = now_ms.saturating_sub(previous);
        if gap <= self.suspend_threshold_ms {
            return Vec::new();
        }
        info!(gap_ms = gap, "suspend detected, reconnecting");
        self.restart(true)
    }

    /// Stop all polling for good; a reload is taking over.
    pub fn mark_reload_in_progress(&mut self) -> Vec<PollerAction> {
        if self.reload_in_progress {
            return Vec::new();
        }
        self.reload_in_progress = true;
        let mut actions = Vec::new();
        if self.outstanding {
            self.outstanding = false;
            actions.push(PollerAction::AbortOutstanding);
        }
        if self.state == PollerState::Backoff {
            actions.push(PollerAction::CancelRetry);
        }
        if self.state != PollerState::Expired {
            self.state = PollerState::Stopped;
        }
        actions
    }

    /// Queue id to delete on teardown; yields at most once, never after expiry.
    pub fn take_cleanup(&mut self) -> Option<String> {
        if self.cleanup_fired || self.state == PollerState::Expired {
            return None;
        }
        self.cleanup_fired = true;
        Some(self.cursor.queue_id.clone())
    }

    fn issue(&mut self, dont_block: bool) -> Vec<PollerAction> {
        if self.reload_in_progress {
            debug!("poll suppressed by reload in progress");
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.outstanding {
            actions.push(PollerAction::AbortOutstanding);
        }
        self.outstanding = true;
        self.state = PollerState::Polling;
        actions.push(PollerAction::IssuePoll(PollRequest {
            queue_id: self.cursor.queue_id.clone(),
            last_event_id: self.cursor.last_event_id,
            dont_block,
            timeout: self.request_timeout,
        }));
        actions
    }
}
