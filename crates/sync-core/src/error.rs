use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Network or transport failure; retried with backoff.
    TransientNetwork,
    /// Server told us the event queue is gone; only a reload recovers.
    ProtocolFatal,
    /// Duplicate insert, unknown message reference or malformed local id.
    LocalConsistency,
    /// Caller misuse such as selecting a message that does not exist.
    Programming,
    /// Invalid input or configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Rate-limited by the server.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
}

/// Stable engine error payload emitted across the command/signal boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new engine error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl std::fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Programming,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::TransientNetwork | SyncErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to engine error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        429 => SyncErrorCategory::RateLimited,
        408 => SyncErrorCategory::TransientNetwork,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::TransientNetwork,
        _ => SyncErrorCategory::Programming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Config);
        assert_eq!(
            classify_http_status(502),
            SyncErrorCategory::TransientNetwork
        );
        assert_eq!(classify_http_status(700), SyncErrorCategory::Programming);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state("Idle", "retry");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Programming);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
        assert!(err.is_recoverable());
    }
}
