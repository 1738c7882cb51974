//! Forced-reload coordination.
//!
//! A reload goes `Normal -> Pending -> InProgress`. While pending it waits for
//! the user to go idle (longer while composing), bounded by an unconditional
//! maximum wait so stale clients always reload eventually.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    ids::MessageId,
    reload_token::{ComposeDraft, ReloadToken},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReloadState {
    Normal,
    Pending,
    InProgress,
}

/// What to preserve and how urgently to reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOptions {
    pub immediate: bool,
    pub save_pointer: bool,
    pub save_narrow: bool,
    pub save_compose: bool,
    pub send_after_reload: bool,
    /// Notice shown while the reload is pending.
    pub message: Option<String>,
}

impl ReloadOptions {
    /// Options used when the server garbage-collected our queue.
    pub fn queue_expired() -> Self {
        Self {
            immediate: true,
            save_pointer: true,
            save_narrow: true,
            save_compose: true,
            send_after_reload: false,
            message: Some("Reloading: the event queue expired".to_owned()),
        }
    }

    /// Options used for a server `restart` event.
    pub fn server_restart(immediate: bool) -> Self {
        Self {
            immediate,
            save_pointer: true,
            save_narrow: true,
            save_compose: true,
            send_after_reload: false,
            message: Some("The application has been updated; reloading".to_owned()),
        }
    }
}

/// Page state captured by the host at the moment the reload begins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub csrf_token: String,
    pub compose: Option<ComposeDraft>,
    /// Scroll offset of the selected row in the unnarrowed list.
    pub offset: Option<i64>,
    /// Selection and offset of the narrowed list, when a narrow is active.
    pub narrow_pointer: Option<MessageId>,
    pub narrow_offset: Option<i64>,
    pub current_hash: Option<String>,
}

/// Side effects requested by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadAction {
    /// A reload is scheduled; tell the user.
    ShowPending { message: Option<String> },
    /// Stop everything and reload now with these options.
    Begin(ReloadOptions),
}

#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    state: ReloadState,
    options: Option<ReloadOptions>,
    composing: bool,
    idle_deadline_ms: Option<u64>,
    max_deadline_ms: Option<u64>,
    idle_timeout_ms: u64,
    composing_idle_timeout_ms: u64,
    max_wait_ms: u64,
    max_jitter_ms: u64,
    fixed_jitter_ms: Option<u64>,
}

impl ReloadCoordinator {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: ReloadState::Normal,
            options: None,
            composing: false,
            idle_deadline_ms: None,
            max_deadline_ms: None,
            idle_timeout_ms: millis(config.reload_idle_timeout),
            composing_idle_timeout_ms: millis(config.reload_composing_idle_timeout),
            max_wait_ms: millis(config.reload_max_wait),
            max_jitter_ms: millis(config.reload_max_jitter),
            fixed_jitter_ms: None,
        }
    }

    /// Replace the random jitter with a fixed value.
    pub fn with_fixed_jitter(mut self, jitter: Duration) -> Self {
        self.fixed_jitter_ms = Some(millis(jitter));
        self
    }

    pub fn state(&self) -> ReloadState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == ReloadState::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == ReloadState::InProgress
    }

    /// Deadline after which the pending reload fires regardless of activity.
    pub fn max_deadline_ms(&self) -> Option<u64> {
        self.max_deadline_ms
    }

    /// Schedule a reload. A second non-immediate request while pending is a no-op.
    pub fn initiate(&mut self, options: ReloadOptions, now_ms: u64) -> Vec<ReloadAction> {
        match self.state {
            ReloadState::InProgress => {
                debug!("reload already in progress");
                Vec::new()
            }
            ReloadState::Pending if !options.immediate => {
                debug!("reload already pending");
                Vec::new()
            }
            _ if options.immediate => vec![self.begin(options)],
            _ => {
                let jitter = self.jitter_ms();
                self.state = ReloadState::Pending;
                self.idle_deadline_ms = Some(now_ms.saturating_add(self.current_idle_timeout()));
                self.max_deadline_ms = Some(
                    now_ms
                        .saturating_add(self.max_wait_ms)
                        .saturating_add(jitter),
                );
                info!(
                    max_deadline_ms = ?self.max_deadline_ms,
                    "reload pending until idle"
                );
                let message = options.message.clone();
                self.options = Some(options);
                vec![ReloadAction::ShowPending { message }]
            }
        }
    }

    /// User activity pushes the idle deadline back.
    pub fn record_activity(&mut self, now_ms: u64) {
        if self.state == ReloadState::Pending {
            self.idle_deadline_ms = Some(now_ms.saturating_add(self.current_idle_timeout()));
        }
    }

    /// Switch between the composing and the normal idle timeout.
    pub fn set_composing(&mut self, composing: bool, now_ms: u64) {
        self.composing = composing;
        self.record_activity(now_ms);
    }

    /// Fire the reload when a deadline has passed.
    pub fn tick(&mut self, now_ms: u64) -> Option<ReloadAction> {
        if self.state != ReloadState::Pending {
            return None;
        }
        let idle_due = self.idle_deadline_ms.is_some_and(|deadline| now_ms >= deadline);
        let max_due = self.max_deadline_ms.is_some_and(|deadline| now_ms >= deadline);
        if !idle_due && !max_due {
            return None;
        }
        debug!(idle_due, max_due, "pending reload firing");
        let options = self.options.take().unwrap_or_default();
        Some(self.begin(options))
    }

    /// Build the fragment handed to the next page load.
    pub fn build_token(
        options: &ReloadOptions,
        selected_id: Option<MessageId>,
        snapshot: SessionSnapshot,
    ) -> ReloadToken {
        let mut token = ReloadToken {
            csrf_token: Some(snapshot.csrf_token),
            send_after_reload: options.send_after_reload,
            oldhash: snapshot.current_hash,
            ..ReloadToken::default()
        };
        if options.save_compose {
            token.compose = snapshot.compose;
        }
        if options.save_pointer {
            token.pointer = selected_id;
        }
        if options.save_narrow {
            token.offset = snapshot.offset;
            token.narrow_pointer = snapshot.narrow_pointer;
            token.narrow_offset = snapshot.narrow_offset;
        }
        token
    }

    fn begin(&mut self, options: ReloadOptions) -> ReloadAction {
        info!(immediate = options.immediate, "reload in progress");
        self.state = ReloadState::InProgress;
        self.idle_deadline_ms = None;
        self.max_deadline_ms = None;
        ReloadAction::Begin(options)
    }

    fn current_idle_timeout(&self) -> u64 {
        if self.composing {
            self.composing_idle_timeout_ms
        } else {
            self.idle_timeout_ms
        }
    }

    fn jitter_ms(&self) -> u64 {
        if let Some(fixed) = self.fixed_jitter_ms {
            return fixed;
        }
        rand::thread_rng().gen_range(0..=self.max_jitter_ms)
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload_token::ComposeTarget;

    const MINUTE: u64 = 60_000;

    fn coordinator() -> ReloadCoordinator {
        ReloadCoordinator::new(&SyncConfig::default()).with_fixed_jitter(Duration::ZERO)
    }

    fn lazy() -> ReloadOptions {
        ReloadOptions {
            save_pointer: true,
            ..ReloadOptions::default()
        }
    }

    #[test]
    fn immediate_reload_begins_right_away() {
        let mut reload = coordinator();
        let actions = reload.initiate(ReloadOptions::queue_expired(), 0);
        assert!(matches!(
            actions.as_slice(),
            [ReloadAction::Begin(ReloadOptions { save_narrow: true, .. })]
        ));
        assert!(reload.is_in_progress());
        assert!(reload.initiate(ReloadOptions::queue_expired(), 1).is_empty());
    }

    #[test]
    fn pending_reload_fires_after_idle_timeout() {
        let mut reload = coordinator();
        let actions = reload.initiate(lazy(), 0);
        assert_eq!(actions, vec![ReloadAction::ShowPending { message: None }]);
        assert!(reload.is_pending());

        reload.record_activity(50_000);
        assert_eq!(reload.tick(100_000), None);
        assert!(matches!(reload.tick(110_000), Some(ReloadAction::Begin(_))));
        assert!(reload.is_in_progress());
    }

    #[test]
    fn composing_uses_longer_idle_timeout() {
        let mut reload = coordinator();
        reload.initiate(lazy(), 0);
        reload.set_composing(true, 0);

        assert_eq!(reload.tick(2 * MINUTE), None);
        assert!(reload.tick(7 * MINUTE).is_some());
    }

    #[test]
    fn max_wait_bounds_a_pending_reload_even_with_activity() {
        let mut reload = ReloadCoordinator::new(&SyncConfig::default())
            .with_fixed_jitter(Duration::from_secs(120));
        reload.initiate(lazy(), 0);
        assert_eq!(reload.max_deadline_ms(), Some(32 * MINUTE));

        let mut now = 0;
        while now < 32 * MINUTE - 30_000 {
            now += 30_000;
            reload.record_activity(now);
            assert_eq!(reload.tick(now), None, "fired early at {now}");
        }
        assert!(reload.tick(32 * MINUTE).is_some());
    }

    #[test]
    fn immediate_request_overrides_pending_reload() {
        let mut reload = coordinator();
        reload.initiate(lazy(), 0);
        assert!(reload.initiate(lazy(), 1).is_empty());
        assert!(matches!(
            reload.initiate(ReloadOptions::server_restart(true), 2).as_slice(),
            [ReloadAction::Begin(_)]
        ));
    }

    #[test]
    fn random_jitter_stays_within_bounds() {
        let config = SyncConfig::default();
        for _ in 0..20 {
            let mut reload = ReloadCoordinator::new(&config);
            reload.initiate(lazy(), 0);
            let deadline = reload.max_deadline_ms().expect("deadline set");
            assert!((30 * MINUTE..=35 * MINUTE).contains(&deadline));
        }
    }

    #[test]
    fn token_respects_save_flags() {
        let snapshot = SessionSnapshot {
            csrf_token: "csrf".into(),
            compose: Some(ComposeDraft {
                target: ComposeTarget::Stream {
                    stream: "Denmark".into(),
                    topic: "lunch".into(),
                },
                content: "draft".into(),
            }),
            offset: Some(10),
            narrow_pointer: Some(MessageId::Server(7)),
            narrow_offset: Some(3),
            current_hash: Some("#all_messages".into()),
        };

        let token = ReloadCoordinator::build_token(
            &lazy(),
            Some(MessageId::Server(42)),
            snapshot.clone(),
        );
        assert_eq!(token.pointer, Some(MessageId::Server(42)));
        assert_eq!(token.compose, None);
        assert_eq!(token.offset, None);
        assert_eq!(token.csrf_token.as_deref(), Some("csrf"));

        let token = ReloadCoordinator::build_token(
            &ReloadOptions::queue_expired(),
            Some(MessageId::Server(42)),
            snapshot,
        );
        assert!(token.compose.is_some());
        assert_eq!(token.narrow_pointer, Some(MessageId::Server(7)));
        assert_eq!(token.oldhash.as_deref(), Some("#all_messages"));
    }
}
