//! Per-session aggregate tying the poller, store, dispatcher and reload
//! coordinator together.
//!
//! [`SyncEngine`] is sans-IO: callers feed it poll outcomes, timer expiries and
//! user commands, and carry out the [`EngineEffect`]s it returns.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    dispatch::{DispatchReport, DomainHandler, EventDispatcher, EventFailure},
    error::{SyncError, SyncErrorCategory},
    event::{Event, EventDomain},
    ids::{MessageId, MessageIdError, PendingIdAllocator},
    message::{Message, MessageFlags},
    poller::{EventPoller, PollCursor, PollFailure, PollRequest, PollerAction, PollerState},
    reload::{ReloadAction, ReloadCoordinator, ReloadOptions, SessionSnapshot},
    reload_token::{ReloadToken, ReloadTokenError, ReloadTokenSlot},
    store::{MessageStore, SelectPolicy, StoreError},
    types::{LocalEchoDraft, SendOutcome, SyncCommand, UiSignal},
};

impl From<MessageIdError> for SyncError {
    fn from(error: MessageIdError) -> Self {
        SyncError::new(
            SyncErrorCategory::LocalConsistency,
            "invalid_message_id",
            error.to_string(),
        )
    }
}

impl From<ReloadTokenError> for SyncError {
    fn from(error: ReloadTokenError) -> Self {
        let category = match error {
            ReloadTokenError::CsrfMismatch => SyncErrorCategory::Auth,
            ReloadTokenError::AlreadyConsumed => SyncErrorCategory::Programming,
            ReloadTokenError::MissingPrefix
            | ReloadTokenError::MalformedPair(_)
            | ReloadTokenError::InvalidValue { .. } => SyncErrorCategory::Serialization,
        };
        SyncError::new(category, "reload_token_rejected", error.to_string())
    }
}

/// Work the runtime must carry out on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEffect {
    IssuePoll(PollRequest),
    /// Cancel the in-flight poll without reporting a failure.
    AbortPoll,
    ScheduleRetry {
        delay: Duration,
    },
    CancelRetry,
    /// Yield to the scheduler, then call [`SyncEngine::run_deferred`].
    RunDeferred,
    /// Best-effort `DELETE /json/events`.
    DeleteQueue {
        queue_id: String,
    },
    /// Capture the session, build the fragment and navigate.
    Reload(ReloadOptions),
    Signal(UiSignal),
}

/// One page session's sync state.
#[derive(Debug)]
pub struct SyncEngine {
    poller: EventPoller,
    store: MessageStore,
    dispatcher: EventDispatcher,
    reload: ReloadCoordinator,
    echo_ids: PendingIdAllocator,
    initial_pointer: Option<MessageId>,
    last_report: DispatchReport,
}

impl SyncEngine {
    pub fn new(cursor: PollCursor, config: &SyncConfig) -> Self {
        Self {
            poller: EventPoller::new(cursor, config),
            store: MessageStore::new(),
            dispatcher: EventDispatcher::new(),
            reload: ReloadCoordinator::new(config),
            echo_ids: PendingIdAllocator::default(),
            initial_pointer: None,
            last_report: DispatchReport::default(),
        }
    }

    pub fn with_reload_coordinator(mut self, reload: ReloadCoordinator) -> Self {
        self.reload = reload;
        self
    }

    pub fn register_handler(&mut self, domain: EventDomain, handler: impl DomainHandler + 'static) {
        self.dispatcher.register(domain, handler);
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn poller(&self) -> &EventPoller {
        &self.poller
    }

    pub fn reload(&self) -> &ReloadCoordinator {
        &self.reload
    }

    /// Report of the most recently applied batch.
    pub fn last_report(&self) -> &DispatchReport {
        &self.last_report
    }

    /// Consume the cold-start reload token, if any. Must run before [`Self::start`].
    pub fn restore_from_reload(
        &mut self,
        slot: &mut ReloadTokenSlot,
        session_csrf_token: &str,
    ) -> Result<Option<ReloadToken>, SyncError> {
        if self.poller.state() != PollerState::Idle {
            return Err(SyncError::invalid_state(
                self.poller.state(),
                "restore_from_reload",
            ));
        }
        match slot.consume(session_csrf_token) {
            Ok(Some(token)) => {
                info!(pointer = ?token.pointer, "restoring state from reload token");
                self.initial_pointer = token.pointer;
                Ok(Some(token))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                warn!(error = %err, "reload token rejected");
                Err(err.into())
            }
        }
    }

    pub fn start(&mut self) -> Result<Vec<EngineEffect>, SyncError> {
        if self.reload.is_in_progress() {
            return Err(SyncError::invalid_state(self.reload.state(), "start"));
        }
        let actions = self.poller.start()?;
        Ok(self.poller_effects(actions, 0))
    }

    /// Apply one successful poll response.
    ///
    /// The cursor moves to the highest event id in the batch before any event
    /// is applied; undecodable events are skipped but still advance it.
    pub fn handle_events(&mut self, raw_events: Vec<Value>, now_ms: u64) -> Vec<EngineEffect> {
        if self.reload.is_in_progress() {
            debug!(count = raw_events.len(), "batch ignored during reload");
            return Vec::new();
        }

        let mut failures = Vec::new();
        let mut events = Vec::with_capacity(raw_events.len());
        let mut max_event_id: Option<u64> = None;
        for raw in raw_events {
            match Event::decode(raw) {
                Ok(event) => {
                    max_event_id = max_event_id.max(Some(event.id));
                    events.push(event);
                }
                Err(err) => {
                    max_event_id = max_event_id.max(err.event_id());
                    warn!(error = %err, "undecodable event skipped");
                    failures.push(EventFailure {
                        event_id: err.event_id(),
                        error: SyncError::new(
                            SyncErrorCategory::Serialization,
                            "event_decode_failed",
                            err.to_string(),
                        ),
                    });
                }
            }
        }

        let actions = self.poller.record_success(max_event_id);
        let mut effects = self.poller_effects(actions, now_ms);

        let mut report = self.dispatcher.dispatch(&mut self.store, events);
        failures.append(&mut report.failures);
        report.failures = failures;
        debug!(
            applied = report.applied,
            failed = report.failures.len(),
            last_event_id = self.poller.cursor().last_event_id,
            "batch applied"
        );

        self.apply_initial_pointer();
        effects.extend(self.render_effects());
        if self.store.has_deferred_work() {
            effects.push(EngineEffect::RunDeferred);
        }
        if let Some(options) = report.reload.clone() {
            effects.extend(self.initiate_reload(options, now_ms));
        }
        self.last_report = report;

        let actions = self.poller.poll_again();
        effects.extend(self.poller_effects(actions, now_ms));
        effects
    }

    pub fn handle_poll_failure(&mut self, failure: PollFailure, now_ms: u64) -> Vec<EngineEffect> {
        let actions = self.poller.record_failure(failure);
        self.poller_effects(actions, now_ms)
    }

    pub fn retry_elapsed(&mut self) -> Vec<EngineEffect> {
        let actions = self.poller.retry_elapsed();
        self.poller_effects(actions, 0)
    }

    pub fn restart(&mut self, dont_block: bool) -> Vec<EngineEffect> {
        let actions = self.poller.restart(dont_block);
        self.poller_effects(actions, 0)
    }

    pub fn watchdog_sample(&mut self, now_ms: u64) -> Vec<EngineEffect> {
        let actions = self.poller.watchdog_sample(now_ms);
        self.poller_effects(actions, now_ms)
    }

    /// Run store work deferred to the next scheduler tick.
    pub fn run_deferred(&mut self) -> Vec<EngineEffect> {
        let executed = self.store.run_deferred();
        if executed > 0 {
            debug!(executed, "deferred store work ran");
        }
        self.render_effects()
    }

    pub fn initiate_reload(&mut self, options: ReloadOptions, now_ms: u64) -> Vec<EngineEffect> {
        let actions = self.reload.initiate(options, now_ms);
        actions
            .into_iter()
            .flat_map(|action| self.reload_effects(action))
            .collect()
    }

    pub fn tick_reload(&mut self, now_ms: u64) -> Vec<EngineEffect> {
        match self.reload.tick(now_ms) {
            Some(action) => self.reload_effects(action),
            None => Vec::new(),
        }
    }

    pub fn record_activity(&mut self, now_ms: u64) {
        self.reload.record_activity(now_ms);
    }

    pub fn set_composing(&mut self, composing: bool, now_ms: u64) {
        self.reload.set_composing(composing, now_ms);
    }

    /// URL fragment handed to the next page load.
    pub fn reload_fragment(&self, options: &ReloadOptions, snapshot: SessionSnapshot) -> String {
        ReloadCoordinator::build_token(options, self.store.selected_id(), snapshot).encode()
    }

    /// Show a just-sent message under a fresh provisional id.
    pub fn local_echo(
        &mut self,
        draft: LocalEchoDraft,
    ) -> Result<(MessageId, Vec<EngineEffect>), SyncError> {
        if self.reload.is_in_progress() {
            return Err(SyncError::invalid_state(self.reload.state(), "local_echo"));
        }
        let base = self.store.max_server_id().unwrap_or_default();
        let local_id = loop {
            let candidate = MessageId::Pending(self.echo_ids.allocate(base)?);
            if !self.store.contains(candidate) {
                break candidate;
            }
        };

        let rendered = draft
            .rendered_content
            .unwrap_or_else(|| draft.content.clone());
        self.store.add_messages(vec![Message {
            id: local_id,
            sender_id: draft.sender_id,
            sender_full_name: draft.sender_full_name,
            recipient: draft.recipient,
            raw_content: Some(draft.content),
            content: rendered,
            timestamp: draft.timestamp,
            flags: MessageFlags::default(),
            edit_history: Vec::new(),
            submessages: Vec::new(),
            locally_echoed: true,
            failed_request: false,
        }]);
        debug!(%local_id, "local echo inserted");

        let mut effects = self.render_effects();
        effects.push(EngineEffect::Signal(UiSignal::LocalEchoed { local_id }));
        Ok((local_id, effects))
    }

    /// Reconcile a local echo with the result of its send request.
    pub fn apply_send_outcome(
        &mut self,
        local_id: MessageId,
        outcome: SendOutcome,
    ) -> Result<Vec<EngineEffect>, SyncError> {
        match outcome {
            SendOutcome::Success { message_id } => {
                let server_id = MessageId::Server(message_id);
                let echo_live = self
                    .store
                    .get(local_id)
                    .is_some_and(|message| message.id == local_id);
                let mut effects = Vec::new();
                match self.store.get(server_id).map(|message| message.id) {
                    Some(current) if current == local_id => {
                        debug!(%local_id, %server_id, "id change already queued");
                    }
                    Some(_) => {
                        if echo_live {
                            warn!(%local_id, %server_id, "server copy stored beside its echo");
                            let was_selected = self.store.selected_id() == Some(local_id);
                            self.store.remove_messages(&[local_id]);
                            if was_selected {
                                self.store.select(server_id, SelectPolicy::Exact)?;
                            }
                        }
                    }
                    None => {
                        if !echo_live {
                            return Err(StoreError::UnknownMessage(local_id).into());
                        }
                        self.store.schedule_id_change(local_id, server_id);
                        effects.push(EngineEffect::RunDeferred);
                    }
                }
                let mut rendered = self.render_effects();
                rendered.append(&mut effects);
                Ok(rendered)
            }
            SendOutcome::Failure { error } => {
                self.store.mark_send_failed(local_id)?;
                warn!(%local_id, error = %error, "send failed");
                let mut effects = self.render_effects();
                effects.push(EngineEffect::Signal(UiSignal::SendFailed {
                    local_id,
                    code: error.code,
                }));
                Ok(effects)
            }
        }
    }

    pub fn select(
        &mut self,
        target: MessageId,
        policy: SelectPolicy,
    ) -> Result<Vec<EngineEffect>, SyncError> {
        self.store.select(target, policy).map_err(|err| match err {
            StoreError::UnknownMessage(_) => SyncError::new(
                SyncErrorCategory::Programming,
                "select_missing_message",
                err.to_string(),
            ),
            other => other.into(),
        })?;
        Ok(self.render_effects())
    }

    pub fn set_topic_muted(&mut self, stream_id: u64, topic: &str, muted: bool) -> Vec<EngineEffect> {
        self.store.set_topic_muted(stream_id, topic, muted);
        self.render_effects()
    }

    /// Page teardown: delete the server queue at most once.
    pub fn teardown(&mut self) -> Vec<EngineEffect> {
        match self.poller.take_cleanup() {
            Some(queue_id) => vec![EngineEffect::DeleteQueue { queue_id }],
            None => Vec::new(),
        }
    }

    /// Apply one frontend command.
    pub fn handle_command(
        &mut self,
        command: SyncCommand,
        now_ms: u64,
    ) -> Result<Vec<EngineEffect>, SyncError> {
        match command {
            SyncCommand::RestartPolling { dont_block } => Ok(self.restart(dont_block)),
            SyncCommand::LocalEcho(draft) => self.local_echo(draft).map(|(_, effects)| effects),
            SyncCommand::SendOutcome { local_id, outcome } => {
                self.apply_send_outcome(local_id, outcome)
            }
            SyncCommand::ComposeStarted => {
                self.set_composing(true, now_ms);
                Ok(Vec::new())
            }
            SyncCommand::ComposeFinished => {
                self.set_composing(false, now_ms);
                Ok(Vec::new())
            }
            SyncCommand::UserActivity => {
                self.record_activity(now_ms);
                Ok(Vec::new())
            }
            SyncCommand::SetTopicMuted {
                stream_id,
                topic,
                muted,
            } => Ok(self.set_topic_muted(stream_id, &topic, muted)),
            SyncCommand::Select { id, closest } => {
                let policy = if closest {
                    SelectPolicy::Closest
                } else {
                    SelectPolicy::Exact
                };
                self.select(id, policy)
            }
            SyncCommand::InitiateReload(options) => Ok(self.initiate_reload(options, now_ms)),
            SyncCommand::Teardown => Ok(self.teardown()),
        }
    }

    fn apply_initial_pointer(&mut self) {
        let Some(pointer) = self.initial_pointer else {
            return;
        };
        if self.store.visible_ids().is_empty() {
            return;
        }
        match self.store.select(pointer, SelectPolicy::Closest) {
            Ok(selected) => debug!(%pointer, %selected, "initial pointer restored"),
            Err(err) => warn!(%pointer, error = %err, "initial pointer not restored"),
        }
        self.initial_pointer = None;
    }

    fn render_effects(&mut self) -> Vec<EngineEffect> {
        self.store
            .take_render_signals()
            .into_iter()
            .map(|signal| EngineEffect::Signal(UiSignal::Render(signal)))
            .collect()
    }

    fn poller_effects(&mut self, actions: Vec<PollerAction>, now_ms: u64) -> Vec<EngineEffect> {
        let mut effects = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                PollerAction::IssuePoll(request) => effects.push(EngineEffect::IssuePoll(request)),
                PollerAction::AbortOutstanding => effects.push(EngineEffect::AbortPoll),
                PollerAction::ScheduleRetry { delay } => {
                    effects.push(EngineEffect::ScheduleRetry { delay })
                }
                PollerAction::CancelRetry => effects.push(EngineEffect::CancelRetry),
                PollerAction::ShowConnectionError { failures } => {
                    effects.push(EngineEffect::Signal(UiSignal::ConnectionError { failures }))
                }
                PollerAction::ClearConnectionError => {
                    effects.push(EngineEffect::Signal(UiSignal::ConnectionRestored))
                }
                PollerAction::QueueExpired => {
                    effects.extend(self.initiate_reload(ReloadOptions::queue_expired(), now_ms))
                }
            }
        }
        effects
    }

    fn reload_effects(&mut self, action: ReloadAction) -> Vec<EngineEffect> {
        match action {
            ReloadAction::ShowPending { message } => {
                vec![EngineEffect::Signal(UiSignal::ReloadPending { message })]
            }
            ReloadAction::Begin(options) => {
                let actions = self.poller.mark_reload_in_progress();
                let mut effects = self.poller_effects(actions, 0);
                effects.push(EngineEffect::Signal(UiSignal::Reloading {
                    immediate: options.immediate,
                }));
                effects.push(EngineEffect::Reload(options));
                effects
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        dispatch::HandlerError,
        event::DomainEvent,
        message::Recipient,
        reload_token::{ComposeDraft, ComposeTarget},
        store::RenderSignal,
    };

    fn engine() -> SyncEngine {
        let config = SyncConfig::default();
        SyncEngine::new(PollCursor::new("q-1", -1), &config).with_reload_coordinator(
            ReloadCoordinator::new(&config).with_fixed_jitter(Duration::ZERO),
        )
    }

    fn started() -> SyncEngine {
        let mut engine = engine();
        engine.start().expect("engine starts");
        engine
    }

    fn raw_message(event_id: u64, message_id: u64) -> Value {
        json!({
            "id": event_id,
            "type": "message",
            "message": {
                "id": message_id,
                "sender_id": 7,
                "sender_full_name": "Iago",
                "type": "stream",
                "stream_id": 3,
                "display_recipient": "Denmark",
                "subject": "lunch",
                "content": "<p>hi</p>",
                "timestamp": 1_700_000_000,
            },
            "flags": [],
        })
    }

    fn draft() -> LocalEchoDraft {
        LocalEchoDraft {
            sender_id: 7,
            sender_full_name: "Iago".into(),
            recipient: Recipient::Stream {
                stream_id: 3,
                stream: "Denmark".into(),
                topic: "lunch".into(),
            },
            content: "hello".into(),
            rendered_content: None,
            timestamp: 1_700_000_100,
        }
    }

    fn network_error() -> PollFailure {
        PollFailure::network("connection reset")
    }

    fn issued_polls(effects: &[EngineEffect]) -> Vec<&PollRequest> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                EngineEffect::IssuePoll(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn engine_with_handlers_can_cross_threads() {
        fn assert_send_sync<T: Send + Sync>(_: &T) {}

        let mut engine = started();
        engine.register_handler(
            EventDomain::Presence,
            |_: &DomainEvent| -> Result<(), HandlerError> { Ok(()) },
        );
        assert_send_sync(&engine);
    }

    #[test]
    fn start_issues_one_blocking_poll() {
        let mut engine = engine();
        let effects = engine.start().expect("engine starts");
        let polls = issued_polls(&effects);
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].queue_id, "q-1");
        assert_eq!(polls[0].last_event_id, -1);
        assert!(!polls[0].dont_block);
        assert!(engine.start().is_err());
    }

    #[test]
    fn cursor_advances_to_batch_maximum_and_never_back() {
        let mut engine = started();
        let effects = engine.handle_events(
            vec![
                raw_message(7, 100),
                raw_message(5, 101),
                json!({"id": 9, "type": "update_message_flags", "op": "bogus"}),
            ],
            0,
        );

        assert_eq!(engine.poller().cursor().last_event_id, 9);
        assert_eq!(engine.store().len(), 2);
        assert_eq!(engine.last_report().failures.len(), 1);
        assert_eq!(engine.last_report().failures[0].event_id, Some(9));
        let polls = issued_polls(&effects);
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].last_event_id, 9);

        engine.handle_events(vec![raw_message(3, 102)], 0);
        assert_eq!(engine.poller().cursor().last_event_id, 9);

        engine.handle_events(Vec::new(), 0);
        assert_eq!(engine.poller().cursor().last_event_id, 9);
    }

    #[test]
    fn redelivered_batch_is_absorbed_by_dedup() {
        let mut engine = started();
        engine.handle_events(vec![raw_message(1, 100)], 0);
        engine.handle_events(vec![raw_message(1, 100)], 0);
        assert_eq!(engine.store().all_ids(), vec![MessageId::Server(100)]);
    }

    #[test]
    fn three_network_errors_back_off_then_recover() {
        let mut engine = started();
        let mut delays = Vec::new();
        for _ in 0..3 {
            let effects = engine.handle_poll_failure(network_error(), 0);
            for effect in &effects {
                if let EngineEffect::ScheduleRetry { delay } = effect {
                    delays.push(delay.as_secs_f64());
                }
            }
            assert_eq!(issued_polls(&engine.retry_elapsed()).len(), 1);
        }

        for (delay, exponent) in delays.iter().zip([0.5_f64, 1.0, 1.5]) {
            assert!((delay - exponent.exp()).abs() < 1e-6, "delay {delay}");
        }
        assert_eq!(engine.poller().failures(), 3);

        engine.handle_events(Vec::new(), 0);
        assert_eq!(engine.poller().failures(), 0);
    }

    #[test]
    fn fifth_failure_shows_banner_until_success() {
        let mut engine = started();
        let mut banners = 0;
        for attempt in 1..=6 {
            let effects = engine.handle_poll_failure(network_error(), 0);
            let shown = effects.iter().any(|effect| {
                matches!(
                    effect,
                    EngineEffect::Signal(UiSignal::ConnectionError { .. })
                )
            });
            if shown {
                banners += 1;
                assert_eq!(attempt, 5);
            }
            engine.retry_elapsed();
        }
        assert_eq!(banners, 1);

        let effects = engine.handle_events(Vec::new(), 0);
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::ConnectionRestored)));
    }

    #[test]
    fn queue_expiry_forces_immediate_reload_with_narrow() {
        let mut engine = started();
        let effects = engine.handle_poll_failure(
            PollFailure::from_response(400, r#"{"code":"BAD_EVENT_QUEUE_ID"}"#, None),
            0,
        );

        let reload = effects
            .iter()
            .find_map(|effect| match effect {
                EngineEffect::Reload(options) => Some(options.clone()),
                _ => None,
            })
            .expect("reload requested");
        assert!(reload.immediate);
        assert!(reload.save_narrow);
        assert!(engine.reload().is_in_progress());
        assert_eq!(engine.poller().state(), PollerState::Expired);
        assert!(engine.retry_elapsed().is_empty());
        assert!(engine.restart(true).is_empty());
        assert!(engine.teardown().is_empty());
    }

    #[test]
    fn suspend_during_backoff_reconnects_and_expiry_still_reloads() {
        let mut engine = started();
        engine.handle_poll_failure(network_error(), 0);
        let effects = engine.watchdog_sample(0);
        assert!(effects.is_empty());
        let effects = engine.watchdog_sample(30_000);
        assert_eq!(effects[0], EngineEffect::CancelRetry);
        assert!(issued_polls(&effects)[0].dont_block);

        let effects = engine.handle_poll_failure(
            PollFailure::from_response(400, r#"{"code":"BAD_EVENT_QUEUE_ID"}"#, None),
            30_000,
        );
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, EngineEffect::Reload(_)))
        );
        assert!(issued_polls(&effects).is_empty());
    }

    #[test]
    fn restart_event_waits_for_idle_then_stops_polling() {
        let mut engine = started();
        let effects = engine.handle_events(
            vec![json!({"id": 1, "type": "restart", "immediate": false})],
            0,
        );
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::ReloadPending {
            message: ReloadOptions::server_restart(false).message,
        })));
        assert_eq!(issued_polls(&effects).len(), 1);

        engine.record_activity(30_000);
        assert!(engine.tick_reload(60_000).is_empty());

        let effects = engine.tick_reload(90_000);
        assert_eq!(effects[0], EngineEffect::AbortPoll);
        assert!(
            effects
                .iter()
                .any(|effect| matches!(effect, EngineEffect::Reload(_)))
        );

        assert!(engine.handle_events(vec![raw_message(2, 100)], 90_001).is_empty());
        assert!(engine.store().is_empty());
        assert_eq!(engine.teardown().len(), 1);
        assert!(engine.teardown().is_empty());
    }

    #[test]
    fn local_echo_is_reconciled_to_server_id_and_keeps_selection() {
        let mut engine = started();
        engine.handle_events(vec![raw_message(1, 100)], 0);
        let (local_id, effects) = engine.local_echo(draft()).expect("echo inserted");
        assert_eq!(local_id.to_string(), "100.01");
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::LocalEchoed { local_id })));

        engine
            .select(local_id, SelectPolicy::Exact)
            .expect("echo selectable");
        let effects = engine
            .apply_send_outcome(local_id, SendOutcome::Success { message_id: 205 })
            .expect("send confirmed");
        assert!(effects.contains(&EngineEffect::RunDeferred));
        assert!(engine.store().get(MessageId::Server(205)).is_some());

        let effects = engine.run_deferred();
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::Render(
            RenderSignal::IdChanged {
                old: local_id,
                new: MessageId::Server(205),
            }
        ))));
        assert!(engine.store().get(local_id).is_none());
        assert_eq!(
            engine
                .store()
                .get(MessageId::Server(205))
                .expect("reconciled")
                .id,
            MessageId::Server(205)
        );
        assert_eq!(engine.store().selected_id(), Some(MessageId::Server(205)));
    }

    #[test]
    fn ack_and_event_for_same_echo_keep_one_copy() {
        let mut engine = started();
        engine.handle_events(vec![raw_message(1, 100)], 0);
        let (local_id, _) = engine.local_echo(draft()).expect("echo inserted");
        engine
            .apply_send_outcome(local_id, SendOutcome::Success { message_id: 205 })
            .expect("send confirmed");

        let mut event = raw_message(2, 205);
        event["local_message_id"] = json!(local_id.to_string());
        engine.handle_events(vec![event], 0);
        engine.run_deferred();

        assert_eq!(
            engine.store().all_ids(),
            vec![MessageId::Server(100), MessageId::Server(205)]
        );
        assert!(engine.last_report().failures.is_empty());
    }

    #[test]
    fn failed_send_keeps_echo_marked() {
        let mut engine = started();
        let (local_id, _) = engine.local_echo(draft()).expect("echo inserted");
        assert_eq!(local_id.to_string(), "0.01");

        let effects = engine
            .apply_send_outcome(
                local_id,
                SendOutcome::Failure {
                    error: SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "slow"),
                },
            )
            .expect("failure recorded");
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::SendFailed {
            local_id,
            code: "rate_limited".into(),
        })));
        assert!(
            engine
                .store()
                .get(local_id)
                .expect("echo kept")
                .failed_request
        );
    }

    #[test]
    fn reload_token_round_trips_through_the_next_session() {
        let mut engine = started();
        engine.handle_events(vec![raw_message(1, 40), raw_message(2, 42)], 0);
        engine
            .select(MessageId::Server(42), SelectPolicy::Exact)
            .expect("selectable");

        let snapshot = SessionSnapshot {
            csrf_token: "csrf-1".into(),
            compose: Some(ComposeDraft {
                target: ComposeTarget::Stream {
                    stream: "Denmark".into(),
                    topic: "lunch".into(),
                },
                content: "see you".into(),
            }),
            ..SessionSnapshot::default()
        };
        let fragment = engine.reload_fragment(&ReloadOptions::queue_expired(), snapshot);

        let mut next = engine_with_fragment(&fragment, "csrf-1");
        let token = next.0.expect("token restored").expect("token present");
        assert_eq!(token.pointer, Some(MessageId::Server(42)));
        assert!(token.compose.is_some());

        next.1.start().expect("starts after restore");
        next.1
            .handle_events(vec![raw_message(3, 41), raw_message(4, 43)], 0);
        assert_eq!(next.1.store().selected_id(), Some(MessageId::Server(41)));

        let forged = engine_with_fragment(&fragment, "someone-else");
        assert_eq!(
            forged.0.expect_err("csrf mismatch").category,
            SyncErrorCategory::Auth
        );
    }

    fn engine_with_fragment(
        fragment: &str,
        csrf: &str,
    ) -> (Result<Option<ReloadToken>, SyncError>, SyncEngine) {
        let mut engine = engine();
        let mut slot = ReloadTokenSlot::new(Some(format!("#{fragment}")));
        let restored = engine.restore_from_reload(&mut slot, csrf);
        assert!(matches!(
            engine.restore_from_reload(&mut slot, csrf),
            Err(SyncError {
                category: SyncErrorCategory::Programming,
                ..
            })
        ));
        (restored, engine)
    }

    #[test]
    fn commands_drive_selection_and_muting() {
        let mut engine = started();
        engine.handle_events(vec![raw_message(1, 10), raw_message(2, 15)], 0);

        let effects = engine
            .handle_command(
                SyncCommand::Select {
                    id: MessageId::Server(13),
                    closest: true,
                },
                0,
            )
            .expect("closest selection");
        assert!(effects.contains(&EngineEffect::Signal(UiSignal::Render(
            RenderSignal::SelectionChanged(Some(MessageId::Server(15)))
        ))));

        let err = engine
            .handle_command(
                SyncCommand::Select {
                    id: MessageId::Server(11),
                    closest: false,
                },
                0,
            )
            .expect_err("exact selection of a missing id fails");
        assert_eq!(err.category, SyncErrorCategory::Programming);

        let effects = engine
            .handle_command(
                SyncCommand::SetTopicMuted {
                    stream_id: 3,
                    topic: "LUNCH".into(),
                    muted: true,
                },
                0,
            )
            .expect("mute applied");
        assert_eq!(
            effects,
            vec![EngineEffect::Signal(UiSignal::Render(RenderSignal::Rerender))]
        );
        assert!(engine.store().visible_ids().is_empty());
    }
}
