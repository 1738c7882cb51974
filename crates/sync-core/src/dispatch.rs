//! Routes a decoded event batch to the message store and domain handlers.
//!
//! Message events are bucketed and applied in a fixed order (inserts, then
//! edits and widgets, then flags and deletions) so later buckets can see
//! messages inserted earlier in the same batch. Everything else is delivered
//! afterwards in batch order. A failing event is recorded and skipped.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    error::{SyncError, SyncErrorCategory},
    event::{DomainEvent, Event, EventDomain, EventKind, NewMessageEvent},
    ids::MessageId,
    reload::ReloadOptions,
    store::{MessageStore, StoreError},
};

/// Failure reported by a domain handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler rejected '{event_type}' event: {reason}")]
    Rejected { event_type: String, reason: String },
    #[error("handler state is inconsistent: {0}")]
    Inconsistent(String),
}

impl From<HandlerError> for SyncError {
    fn from(error: HandlerError) -> Self {
        SyncError::new(
            SyncErrorCategory::LocalConsistency,
            "domain_handler_failed",
            error.to_string(),
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(error: StoreError) -> Self {
        let category = match error {
            StoreError::NothingToSelect(_) | StoreError::InvalidReassign { .. } => {
                SyncErrorCategory::Programming
            }
            StoreError::Duplicate(_) | StoreError::UnknownMessage(_) => {
                SyncErrorCategory::LocalConsistency
            }
        };
        SyncError::new(category, "store_error", error.to_string())
    }
}

/// Owner of non-message state (subscriptions, users, settings, ...).
pub trait DomainHandler: Send + Sync {
    fn handle(&mut self, event: &DomainEvent) -> Result<(), HandlerError>;
}

impl<F> DomainHandler for F
where
    F: FnMut(&DomainEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&mut self, event: &DomainEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// One event that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    pub event_id: Option<u64>,
    pub error: SyncError,
}

/// What happened while applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub applied: usize,
    pub failures: Vec<EventFailure>,
    /// Domain events nobody had registered for.
    pub unhandled: usize,
    /// Local echoes confirmed by their server copy: `(local, server)`.
    pub confirmed_echoes: Vec<(MessageId, MessageId)>,
    /// Reload requested by a server `restart` event.
    pub reload: Option<ReloadOptions>,
}

impl DispatchReport {
    fn fail(&mut self, event_id: u64, error: impl Into<SyncError>) {
        let error = error.into();
        warn!(event_id, error = %error, "event skipped");
        self.failures.push(EventFailure {
            event_id: Some(event_id),
            error,
        });
    }
}

/// Exhaustive router from [`EventKind`] to the store or a [`DomainHandler`].
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventDomain, Box<dyn DomainHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("domains", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route every event of `domain` to `handler`, replacing any earlier one.
    pub fn register(&mut self, domain: EventDomain, handler: impl DomainHandler + 'static) {
        self.handlers.insert(domain, Box::new(handler));
    }

    pub fn dispatch(&mut self, store: &mut MessageStore, events: Vec<Event>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut inserts = Vec::new();
        let mut edits = Vec::new();
        let mut flags_and_deletes = Vec::new();
        let mut rest = Vec::new();

        for event in events {
            match &event.kind {
                EventKind::Message(_) => inserts.push(event),
                EventKind::UpdateMessage(_) | EventKind::Submessage(_) => edits.push(event),
                EventKind::UpdateMessageFlags(_) | EventKind::DeleteMessage(_) => {
                    flags_and_deletes.push(event)
                }
                _ => rest.push(event),
            }
        }
        debug!(
            inserts = inserts.len(),
            edits = edits.len(),
            flags_and_deletes = flags_and_deletes.len(),
            other = rest.len(),
            "dispatching event batch"
        );

        self.apply_inserts(store, inserts, &mut report);
        for event in edits.into_iter().chain(flags_and_deletes) {
            self.apply_message_event(store, event, &mut report);
        }
        for event in rest {
            self.apply_other(store, event, &mut report);
        }
        report
    }

    fn apply_inserts(
        &mut self,
        store: &mut MessageStore,
        mut inserts: Vec<Event>,
        report: &mut DispatchReport,
    ) {
        inserts.sort_by_key(|event| match &event.kind {
            EventKind::Message(inner) => inner.message.id,
            _ => MessageId::Server(0),
        });

        let mut fresh = Vec::with_capacity(inserts.len());
        for event in inserts {
            let EventKind::Message(inner) = event.kind else {
                continue;
            };
            let NewMessageEvent {
                message,
                local_message_id,
                ..
            } = inner;

            if let Some(local_id) = local_message_id.filter(MessageId::is_pending) {
                let server_id = message.id;
                let echo_live = store.get(local_id).is_some_and(|echo| echo.id == local_id);
                if echo_live {
                    match store.confirm_local_echo(local_id, message) {
                        Ok(()) => {
                            report.applied += 1;
                            report.confirmed_echoes.push((local_id, server_id));
                        }
                        Err(err) => report.fail(event.id, err),
                    }
                    continue;
                }
                if store.contains(server_id) {
                    debug!(%local_id, %server_id, "local echo already reconciled");
                    report.applied += 1;
                    continue;
                }
            }
            fresh.push((event.id, message));
        }

        if fresh.is_empty() {
            return;
        }
        let event_ids: HashMap<MessageId, u64> = fresh
            .iter()
            .map(|(event_id, message)| (message.id, *event_id))
            .collect();
        let inserted = store.add_messages(fresh.into_iter().map(|(_, message)| message).collect());
        report.applied += inserted.inserted.len();
        for duplicate in inserted.duplicates {
            let event_id = event_ids.get(&duplicate).copied().unwrap_or_default();
            report.fail(event_id, StoreError::Duplicate(duplicate));
        }
    }

    fn apply_message_event(
        &mut self,
        store: &mut MessageStore,
        event: Event,
        report: &mut DispatchReport,
    ) {
        match &event.kind {
            EventKind::UpdateMessage(update) => {
                store.apply_update(update);
                report.applied += 1;
            }
            EventKind::Submessage(submessage) => match store.add_submessage(submessage) {
                Ok(_) => report.applied += 1,
                Err(StoreError::UnknownMessage(id)) => {
                    debug!(message_id = %id, "submessage for unknown message dropped");
                    report.applied += 1;
                }
                Err(err) => report.fail(event.id, err),
            },
            EventKind::UpdateMessageFlags(flags) => {
                store.apply_flags(flags);
                report.applied += 1;
            }
            EventKind::DeleteMessage(delete) => {
                let ids: Vec<MessageId> = delete.ids().into_iter().map(MessageId::Server).collect();
                store.remove_messages(&ids);
                report.applied += 1;
            }
            _ => self.apply_other(store, event, report),
        }
    }

    fn apply_other(&mut self, store: &mut MessageStore, event: Event, report: &mut DispatchReport) {
        match event.kind {
            EventKind::Heartbeat => {
                trace!(event_id = event.id, "heartbeat");
                report.applied += 1;
            }
            EventKind::Restart(restart) => {
                debug!(event_id = event.id, immediate = restart.immediate, "server requested reload");
                let options = ReloadOptions::server_restart(restart.immediate);
                report.reload = match report.reload.take() {
                    Some(existing) if existing.immediate => Some(existing),
                    _ => Some(options),
                };
                report.applied += 1;
            }
            EventKind::UserTopic(topic) => {
                store.set_topic_muted(topic.stream_id, &topic.topic_name, topic.is_muted());
                report.applied += 1;
            }
            EventKind::Domain(domain_event) => {
                let Some(handler) = self.handlers.get_mut(&domain_event.domain) else {
                    trace!(
                        event_id = event.id,
                        event_type = %domain_event.event_type,
                        "no handler registered"
                    );
                    report.unhandled += 1;
                    return;
                };
                match handler.handle(&domain_event) {
                    Ok(()) => report.applied += 1,
                    Err(err) => report.fail(event.id, err),
                }
            }
            EventKind::Message(_)
            | EventKind::UpdateMessage(_)
            | EventKind::DeleteMessage(_)
            | EventKind::UpdateMessageFlags(_)
            | EventKind::Submessage(_) => {
                error!(event_id = event.id, "message event routed past its bucket");
            }
        }
    }
}
