//! Ordered, deduplicating message cache fed by the event dispatcher.
//!
//! The store keeps every known message (the superset) in id order and a
//! projection of the ones the user can see (muted topics removed unless the
//! message mentions the user). Mutations queue [`RenderSignal`]s that the UI
//! drains once the current batch is fully applied.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    event::{FlagOp, SubmessageEvent, UpdateMessageEvent, UpdateMessageFlagsEvent},
    ids::MessageId,
    message::{EditHistoryEntry, Message, Recipient},
};

/// Errors that can occur while mutating the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A message with this id is already stored.
    #[error("message {0} is already stored")]
    Duplicate(MessageId),
    /// No stored message has this id.
    #[error("message {0} was not found")]
    UnknownMessage(MessageId),
    /// Selection fallback found nothing to select.
    #[error("no message can be selected near {0}")]
    NothingToSelect(MessageId),
    /// Only provisional ids can be reassigned.
    #[error("cannot reassign {old} to {new}: {reason}")]
    InvalidReassign {
        old: MessageId,
        new: MessageId,
        reason: &'static str,
    },
}

/// What the renderer has to do after a store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderSignal {
    /// New highest-id messages at the bottom.
    Appended(Vec<MessageId>),
    /// New lowest-id messages at the top.
    Prepended(Vec<MessageId>),
    /// Order changed in a way partial patching cannot express.
    Rerender,
    /// Content, topic, flags or widgets of these messages changed.
    Updated(Vec<MessageId>),
    /// These messages were deleted.
    Removed(Vec<MessageId>),
    /// A local echo received its server id without moving.
    IdChanged { old: MessageId, new: MessageId },
    /// The selected message pointer moved.
    SelectionChanged(Option<MessageId>),
}

/// How an insert batch was placed relative to the existing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertShape {
    Append,
    Prepend,
    PrependAndAppend,
    Interior,
}

/// Result of [`MessageStore::add_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: Vec<MessageId>,
    pub duplicates: Vec<MessageId>,
    pub shape: Option<InsertShape>,
}

/// Fallback used when the requested selection target is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    /// Missing targets are an error.
    Exact,
    /// Missing targets select the closest visible message.
    Closest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DeferredTask {
    ChangeId { old: MessageId, new: MessageId },
}

/// Ordered message cache keyed by [`MessageId`].
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: HashMap<MessageId, Message>,
    all: VecDeque<MessageId>,
    visible: VecDeque<MessageId>,
    /// Server id -> provisional id for echoes whose id change is still queued.
    aliases: HashMap<MessageId, MessageId>,
    selected: Option<MessageId>,
    muted_topics: HashSet<(u64, String)>,
    deferred: VecDeque<DeferredTask>,
    signals: Vec<RenderSignal>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Every stored id in order, muted messages included.
    pub fn all_ids(&self) -> Vec<MessageId> {
        self.all.iter().copied().collect()
    }

    /// Ids the user can see, in order.
    pub fn visible_ids(&self) -> Vec<MessageId> {
        self.visible.iter().copied().collect()
    }

    pub fn selected_id(&self) -> Option<MessageId> {
        self.selected
    }

    /// Whether a message is stored under `id` (or will be once a queued id change runs).
    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&self.resolve(id))
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&self.resolve(id))
    }

    /// Highest server-confirmed id in the store.
    pub fn max_server_id(&self) -> Option<u64> {
        self.all.iter().rev().find_map(MessageId::as_server)
    }

    /// Drain the render signals accumulated since the last call.
    pub fn take_render_signals(&mut self) -> Vec<RenderSignal> {
        std::mem::take(&mut self.signals)
    }

    pub fn has_deferred_work(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Insert messages, discarding any whose id is already stored.
    pub fn add_messages(&mut self, messages: Vec<Message>) -> InsertReport {
        let mut report = InsertReport::default();
        let mut fresh: Vec<Message> = Vec::with_capacity(messages.len());
        let mut seen = HashSet::new();

        for message in messages {
            if self.contains(message.id) || !seen.insert(message.id) {
                warn!(message_id = %message.id, "dropping duplicate message insert");
                report.duplicates.push(message.id);
                continue;
            }
            fresh.push(message);
        }

        if fresh.is_empty() {
            return report;
        }
        fresh.sort_by_key(|message| message.id);

        let first = self.all.front().copied();
        let last = self.all.back().copied();
        let mut top = Vec::new();
        let mut bottom = Vec::new();
        let mut interior = false;
        for message in &fresh {
            match (first, last) {
                (None, _) | (_, None) => bottom.push(message.id),
                (Some(first), Some(last)) => {
                    if message.id > last {
                        bottom.push(message.id);
                    } else if message.id < first {
                        top.push(message.id);
                    } else {
                        interior = true;
                    }
                }
            }
        }

        report.inserted = fresh.iter().map(|message| message.id).collect();
        for message in fresh {
            trace!(message_id = %message.id, "storing message");
            self.messages.insert(message.id, message);
        }

        if interior {
            debug!(
                count = report.inserted.len(),
                "interior insert forces full re-sort"
            );
            self.all.extend(report.inserted.iter().copied());
            self.all.make_contiguous().sort();
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
            report.shape = Some(InsertShape::Interior);
            return report;
        }

        let visible_top: Vec<MessageId> = top
            .iter()
            .copied()
            .filter(|id| self.is_visible(*id))
            .collect();
        let visible_bottom: Vec<MessageId> = bottom
            .iter()
            .copied()
            .filter(|id| self.is_visible(*id))
            .collect();

        for id in top.iter().rev() {
            self.all.push_front(*id);
        }
        for id in visible_top.iter().rev() {
            self.visible.push_front(*id);
        }
        self.all.extend(bottom.iter().copied());
        self.visible.extend(visible_bottom.iter().copied());

        if !visible_top.is_empty() {
            self.signals.push(RenderSignal::Prepended(visible_top));
        }
        if !visible_bottom.is_empty() {
            self.signals.push(RenderSignal::Appended(visible_bottom));
        }

        report.shape = Some(match (top.is_empty(), bottom.is_empty()) {
            (false, false) => InsertShape::PrependAndAppend,
            (false, true) => InsertShape::Prepend,
            _ => InsertShape::Append,
        });
        report
    }

    /// Apply a content and/or topic edit. Returns the ids that changed.
    pub fn apply_update(&mut self, event: &UpdateMessageEvent) -> Vec<MessageId> {
        let mut updated = Vec::new();
        let mut visibility_changed = false;

        for raw_id in event.affected_ids() {
            let id = self.resolve(MessageId::Server(raw_id));
            let was_visible = self.is_visible(id);
            let Some(message) = self.messages.get_mut(&id) else {
                debug!(message_id = raw_id, "update for unknown message dropped");
                continue;
            };

            let mut entry = EditHistoryEntry {
                timestamp: event.edit_timestamp.unwrap_or(message.timestamp),
                user_id: event.user_id,
                ..EditHistoryEntry::default()
            };
            let mut changed = false;

            // Content edits only apply to the primary message.
            if raw_id == event.message_id
                && let Some(rendered) = &event.rendered_content
            {
                entry.prev_rendered_content = Some(message.content.clone());
                entry.prev_content = message.raw_content.clone();
                message.content = rendered.clone();
                if let Some(raw) = &event.content {
                    message.raw_content = Some(raw.clone());
                }
                changed = true;
            }

            if let Recipient::Stream {
                stream_id,
                stream,
                topic,
            } = &mut message.recipient
            {
                if let Some(new_topic) = &event.subject
                    && new_topic != topic
                {
                    entry.prev_topic = Some(std::mem::replace(topic, new_topic.clone()));
                    changed = true;
                }
                if let Some(new_stream_id) = event.new_stream_id
                    && new_stream_id != *stream_id
                {
                    entry.prev_stream = Some(*stream_id);
                    *stream_id = new_stream_id;
                    // The event carries no name for the new stream.
                    stream.clear();
                    changed = true;
                }
            }

            if changed {
                message.edit_history.insert(0, entry);
                updated.push(id);
                if self.is_visible(id) != was_visible {
                    visibility_changed = true;
                }
            }
        }

        if visibility_changed {
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
        } else if !updated.is_empty() {
            self.signals.push(RenderSignal::Updated(updated.clone()));
        }
        updated
    }

    /// Apply a flag change. Returns the ids whose flag set changed.
    pub fn apply_flags(&mut self, event: &UpdateMessageFlagsEvent) -> Vec<MessageId> {
        let targets: Vec<MessageId> = if event.all {
            self.all.iter().copied().collect()
        } else {
            event
                .messages
                .iter()
                .map(|raw_id| self.resolve(MessageId::Server(*raw_id)))
                .collect()
        };

        let mut changed = Vec::new();
        let mut visibility_changed = false;
        for id in targets {
            let was_visible = self.is_visible(id);
            let Some(message) = self.messages.get_mut(&id) else {
                debug!(message_id = %id, "flag update for unknown message dropped");
                continue;
            };
            let flipped = match event.op {
                FlagOp::Add => message.flags.insert(event.flag),
                FlagOp::Remove => message.flags.remove(event.flag),
            };
            if flipped {
                changed.push(id);
                if self.is_visible(id) != was_visible {
                    visibility_changed = true;
                }
            }
        }

        if visibility_changed {
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
        } else if !changed.is_empty() {
            self.signals.push(RenderSignal::Updated(changed.clone()));
        }
        changed
    }

    /// Attach a widget submessage to its parent message.
    pub fn add_submessage(&mut self, event: &SubmessageEvent) -> Result<MessageId, StoreError> {
        let id = self.resolve(MessageId::Server(event.message_id));
        let message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::UnknownMessage(id))?;
        if message
            .submessages
            .iter()
            .any(|existing| existing.id == event.submessage_id)
        {
            return Err(StoreError::Duplicate(id));
        }
        message.submessages.push(event.to_submessage());
        self.signals.push(RenderSignal::Updated(vec![id]));
        Ok(id)
    }

    /// Remove messages; a removed selection moves to the closest survivor.
    pub fn remove_messages(&mut self, ids: &[MessageId]) -> Vec<MessageId> {
        let mut removed = Vec::new();
        for raw in ids {
            let id = self.resolve(*raw);
            if self.messages.remove(&id).is_none() {
                debug!(message_id = %raw, "delete for unknown message dropped");
                continue;
            }
            self.aliases.retain(|_, target| *target != id);
            if let Ok(idx) = self.all.binary_search(&id) {
                self.all.remove(idx);
            }
            if let Ok(idx) = self.visible.binary_search(&id) {
                self.visible.remove(idx);
            }
            removed.push(id);
        }

        if removed.is_empty() {
            return removed;
        }
        self.signals.push(RenderSignal::Removed(removed.clone()));

        if let Some(selected) = self.selected
            && removed.contains(&selected)
        {
            self.selected = self.closest_id(selected);
            debug!(
                removed = %selected,
                reselected = ?self.selected,
                "selected message removed"
            );
            self.signals
                .push(RenderSignal::SelectionChanged(self.selected));
        }
        removed
    }

    /// Mark an optimistic send as rejected by the server.
    pub fn mark_send_failed(&mut self, id: MessageId) -> Result<(), StoreError> {
        let id = self.resolve(id);
        let message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::UnknownMessage(id))?;
        message.failed_request = true;
        self.signals.push(RenderSignal::Updated(vec![id]));
        Ok(())
    }

    /// Fold the server copy of a local echo into the echo and queue its id change.
    pub fn confirm_local_echo(
        &mut self,
        local_id: MessageId,
        server: Message,
    ) -> Result<(), StoreError> {
        let server_id = server.id;
        if !local_id.is_pending() || server_id.is_pending() {
            return Err(StoreError::InvalidReassign {
                old: local_id,
                new: server_id,
                reason: "expected a provisional id confirmed by a server id",
            });
        }
        if self.messages.contains_key(&server_id) {
            return Err(StoreError::Duplicate(server_id));
        }
        let echo = self
            .messages
            .get_mut(&local_id)
            .ok_or(StoreError::UnknownMessage(local_id))?;

        echo.content = server.content;
        if server.raw_content.is_some() {
            echo.raw_content = server.raw_content;
        }
        echo.timestamp = server.timestamp;
        echo.flags = server.flags;
        echo.sender_full_name = server.sender_full_name;
        echo.failed_request = false;

        self.signals.push(RenderSignal::Updated(vec![local_id]));
        self.schedule_id_change(local_id, server_id);
        Ok(())
    }

    /// Queue a provisional-to-server id change for the next scheduler tick.
    ///
    /// Until it runs, lookups by `new` resolve to the message stored under `old`.
    pub fn schedule_id_change(&mut self, old: MessageId, new: MessageId) {
        if self.aliases.contains_key(&new) {
            debug!(%old, %new, "id change already queued");
            return;
        }
        self.aliases.insert(new, old);
        self.deferred.push_back(DeferredTask::ChangeId { old, new });
    }

    /// Run work deferred to the next tick. Returns the number of tasks executed.
    pub fn run_deferred(&mut self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.deferred.pop_front() {
            match task {
                DeferredTask::ChangeId { old, new } => {
                    if let Err(err) = self.change_message_id(old, new) {
                        warn!(%old, %new, error = %err, "deferred id change skipped");
                    }
                }
            }
            executed += 1;
        }
        executed
    }

    /// Re-key a local echo under its confirmed server id.
    pub fn change_message_id(&mut self, old: MessageId, new: MessageId) -> Result<(), StoreError> {
        if !old.is_pending() || new.is_pending() {
            return Err(StoreError::InvalidReassign {
                old,
                new,
                reason: "only provisional ids can take a server id",
            });
        }
        if self.messages.contains_key(&new) {
            self.aliases.remove(&new);
            return Err(StoreError::Duplicate(new));
        }
        let Some(mut message) = self.messages.remove(&old) else {
            self.aliases.remove(&new);
            return Err(StoreError::UnknownMessage(old));
        };
        self.aliases.remove(&new);

        message.id = new;
        message.locally_echoed = false;
        self.messages.insert(new, message);

        let Ok(idx) = self.all.binary_search(&old) else {
            error!(%old, "message index out of sync with id order");
            self.all.push_back(new);
            self.all.make_contiguous().sort();
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
            self.follow_selection(old, new);
            return Ok(());
        };
        self.all[idx] = new;

        let before_ok = idx == 0 || self.all[idx - 1] < new;
        let after_ok = idx + 1 >= self.all.len() || self.all[idx + 1] > new;
        if before_ok && after_ok {
            if let Some(pos) = self.visible.iter().position(|id| *id == old) {
                self.visible[pos] = new;
            }
            self.signals.push(RenderSignal::IdChanged { old, new });
        } else {
            debug!(%old, %new, "confirmed id moved message, re-sorting");
            self.all.make_contiguous().sort();
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
        }

        self.follow_selection(old, new);
        Ok(())
    }

    /// Mute or unmute a topic; recomputes the visible projection.
    pub fn set_topic_muted(&mut self, stream_id: u64, topic: &str, muted: bool) -> bool {
        let key = (stream_id, topic.to_lowercase());
        let changed = if muted {
            self.muted_topics.insert(key)
        } else {
            self.muted_topics.remove(&key)
        };
        if changed {
            self.rebuild_visible();
            self.signals.push(RenderSignal::Rerender);
        }
        changed
    }

    pub fn is_topic_muted(&self, stream_id: u64, topic: &str) -> bool {
        self.muted_topics
            .contains(&(stream_id, topic.to_lowercase()))
    }

    /// Move the selection pointer.
    pub fn select(
        &mut self,
        target: MessageId,
        policy: SelectPolicy,
    ) -> Result<MessageId, StoreError> {
        let target = self.resolve(target);
        let chosen = if self.visible.binary_search(&target).is_ok() {
            target
        } else {
            match policy {
                SelectPolicy::Exact => {
                    error!(message_id = %target, "selecting a message that is not visible");
                    return Err(StoreError::UnknownMessage(target));
                }
                SelectPolicy::Closest => self
                    .closest_id(target)
                    .ok_or(StoreError::NothingToSelect(target))?,
            }
        };

        if self.selected != Some(chosen) {
            self.selected = Some(chosen);
            self.signals.push(RenderSignal::SelectionChanged(Some(chosen)));
        }
        Ok(chosen)
    }

    /// Closest visible id to `target`; `None` when nothing is visible.
    ///
    /// Runs of provisional ids compare as the nearest server id on their left
    /// during the search; the two ids around the resulting bound are the
    /// candidates. Ties go left.
    pub fn closest_id(&self, target: MessageId) -> Option<MessageId> {
        let items = &self.visible;
        if items.is_empty() {
            return None;
        }
        let target = self.resolve(target);
        if items.binary_search(&target).is_ok() {
            return Some(target);
        }

        let bound = lower_bound(items, target);
        let right = (bound < items.len()).then_some(bound);
        let left = bound.checked_sub(1);

        match (left, right) {
            (Some(left), Some(right)) => {
                let left_distance = items[left].distance(&target);
                let right_distance = items[right].distance(&target);
                if right_distance < left_distance {
                    Some(items[right])
                } else {
                    Some(items[left])
                }
            }
            (Some(idx), None) | (None, Some(idx)) => Some(items[idx]),
            (None, None) => None,
        }
    }

    fn resolve(&self, id: MessageId) -> MessageId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    fn is_visible(&self, id: MessageId) -> bool {
        let Some(message) = self.messages.get(&id) else {
            return false;
        };
        if message.flags.is_mentioned() {
            return true;
        }
        match message.topic_key() {
            Some(key) => !self.muted_topics.contains(&key),
            None => true,
        }
    }

    fn rebuild_visible(&mut self) {
        let visible: VecDeque<MessageId> = self
            .all
            .iter()
            .copied()
            .filter(|id| self.is_visible(*id))
            .collect();
        self.visible = visible;
    }

    fn follow_selection(&mut self, old: MessageId, new: MessageId) {
        if self.selected == Some(old) {
            self.selected = Some(new);
            self.signals.push(RenderSignal::SelectionChanged(Some(new)));
        }
    }
}

/// Comparison key for position `idx`: provisional ids collapse onto the
/// nearest server id to their left (or their own base when none exists).
fn collapsed_key(items: &VecDeque<MessageId>, idx: usize) -> MessageId {
    match items[idx] {
        MessageId::Server(_) => items[idx],
        MessageId::Pending(pending) => (0..idx)
            .rev()
            .map(|i| items[i])
            .find(|id| !id.is_pending())
            .unwrap_or(MessageId::Server(pending.base())),
    }
}

/// First position whose collapsed key is not less than `target`.
fn lower_bound(items: &VecDeque<MessageId>, target: MessageId) -> usize {
    let mut low = 0;
    let mut high = items.len();
    while low < high {
        let mid = low + (high - low) / 2;
        if collapsed_key(items, mid) < target {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ids::PendingId,
        message::{MessageFlag, MessageFlags},
    };

    fn stream_message(id: MessageId, topic: &str) -> Message {
        Message {
            id,
            sender_id: 1,
            sender_full_name: "Iago".into(),
            recipient: Recipient::Stream {
                stream_id: 10,
                stream: "Denmark".into(),
                topic: topic.into(),
            },
            raw_content: Some("hello".into()),
            content: "<p>hello</p>".into(),
            timestamp: 1_700_000_000,
            flags: MessageFlags::default(),
            edit_history: Vec::new(),
            submessages: Vec::new(),
            locally_echoed: id.is_pending(),
            failed_request: false,
        }
    }

    fn server(id: u64) -> Message {
        stream_message(MessageId::Server(id), "lunch")
    }

    fn pending(base: u64, seq: u16) -> MessageId {
        MessageId::Pending(PendingId::new(base, seq).expect("valid pending id"))
    }

    fn store_with(ids: &[u64]) -> MessageStore {
        let mut store = MessageStore::new();
        store.add_messages(ids.iter().map(|id| server(*id)).collect());
        store.take_render_signals();
        store
    }

    fn s(id: u64) -> MessageId {
        MessageId::Server(id)
    }

    #[test]
    fn duplicate_insert_is_discarded() {
        let mut store = store_with(&[10]);
        let mut edited = server(10);
        edited.content = "<p>changed</p>".into();

        let report = store.add_messages(vec![edited, server(11), server(11)]);

        assert_eq!(report.duplicates, vec![s(10), s(11)]);
        assert_eq!(report.inserted, vec![s(11)]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(s(10)).expect("stored").content, "<p>hello</p>");
    }

    #[test]
    fn classifies_append_prepend_and_interior_inserts() {
        let mut store = store_with(&[10, 20]);

        let report = store.add_messages(vec![server(30), server(25)]);
        assert_eq!(report.shape, Some(InsertShape::Append));
        assert_eq!(
            store.take_render_signals(),
            vec![RenderSignal::Appended(vec![s(25), s(30)])]
        );

        let report = store.add_messages(vec![server(5)]);
        assert_eq!(report.shape, Some(InsertShape::Prepend));
        assert_eq!(
            store.take_render_signals(),
            vec![RenderSignal::Prepended(vec![s(5)])]
        );

        let report = store.add_messages(vec![server(15)]);
        assert_eq!(report.shape, Some(InsertShape::Interior));
        assert_eq!(store.take_render_signals(), vec![RenderSignal::Rerender]);
        assert_eq!(
            store.all_ids(),
            vec![s(5), s(10), s(15), s(20), s(25), s(30)]
        );
    }

    #[test]
    fn closest_id_matches_documented_examples() {
        let store = store_with(&[10, 12, 15]);
        assert_eq!(store.closest_id(s(12)), Some(s(12)));
        assert_eq!(store.closest_id(s(11)), Some(s(10)));
        assert_eq!(store.closest_id(s(13)), Some(s(12)));
        assert_eq!(store.closest_id(s(20)), Some(s(15)));
        assert_eq!(store.closest_id(s(1)), Some(s(10)));
        assert_eq!(MessageStore::new().closest_id(s(1)), None);
    }

    #[test]
    fn closest_id_ties_favor_lower_candidate() {
        let store = store_with(&[10, 14]);
        assert_eq!(store.closest_id(s(12)), Some(s(10)));
    }

    #[test]
    fn closest_id_picks_provisional_neighbour_when_nearer() {
        let mut store = store_with(&[10, 12]);
        store.add_messages(vec![stream_message(pending(10, 1), "lunch")]);

        assert_eq!(store.closest_id(s(11)), Some(pending(10, 1)));
        assert_eq!(store.closest_id(pending(10, 1)), Some(pending(10, 1)));

        store.add_messages(vec![stream_message(pending(10, 2), "lunch")]);
        assert_eq!(store.closest_id(pending(10, 3)), Some(pending(10, 2)));
        assert_eq!(store.closest_id(s(12)), Some(s(12)));
    }

    #[test]
    fn closest_id_collapses_provisional_runs_during_search() {
        let mut store = store_with(&[10, 20]);
        store.add_messages(vec![
            stream_message(pending(10, 1), "lunch"),
            stream_message(pending(10, 2), "lunch"),
        ]);

        // 19 lands after the run; 20 is nearer than 10.02.
        assert_eq!(store.closest_id(s(19)), Some(s(20)));
        assert_eq!(store.closest_id(s(11)), Some(pending(10, 2)));
    }

    #[test]
    fn reconciles_local_echo_and_follows_selection() {
        let mut store = store_with(&[100]);
        let local = pending(100, 1);
        store.add_messages(vec![stream_message(local, "lunch")]);
        store.select(local, SelectPolicy::Exact).expect("echo is visible");
        store.take_render_signals();

        store.schedule_id_change(local, s(205));
        assert_eq!(store.get(s(205)).map(|m| m.id), Some(local));
        assert_eq!(store.len(), 2);

        assert_eq!(store.run_deferred(), 1);
        assert!(store.get(local).is_none());
        let confirmed = store.get(s(205)).expect("server id resolves");
        assert_eq!(confirmed.id, s(205));
        assert!(!confirmed.locally_echoed);
        assert_eq!(store.selected_id(), Some(s(205)));
        assert_eq!(
            store.take_render_signals(),
            vec![
                RenderSignal::IdChanged {
                    old: local,
                    new: s(205)
                },
                RenderSignal::SelectionChanged(Some(s(205))),
            ]
        );
    }

    #[test]
    fn reconcile_that_moves_message_forces_rerender() {
        let mut store = store_with(&[100, 150]);
        let local = pending(100, 1);
        store.add_messages(vec![stream_message(local, "lunch")]);
        store.take_render_signals();

        store
            .change_message_id(local, s(205))
            .expect("reassign should work");

        assert_eq!(store.all_ids(), vec![s(100), s(150), s(205)]);
        assert_eq!(store.take_render_signals(), vec![RenderSignal::Rerender]);
    }

    #[test]
    fn reassign_rejects_server_to_server_changes() {
        let mut store = store_with(&[1]);
        let err = store
            .change_message_id(s(1), s(2))
            .expect_err("server ids are final");
        assert!(matches!(err, StoreError::InvalidReassign { .. }));
    }

    #[test]
    fn confirmed_echo_never_exists_twice() {
        let mut store = store_with(&[100]);
        let local = pending(100, 1);
        store.add_messages(vec![stream_message(local, "lunch")]);

        let mut from_server = server(205);
        from_server.content = "<p>rendered by server</p>".into();
        store
            .confirm_local_echo(local, from_server.clone())
            .expect("echo confirmation");

        // Redelivery of the same server message before the tick is a duplicate.
        let report = store.add_messages(vec![from_server]);
        assert_eq!(report.duplicates, vec![s(205)]);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(s(205)).expect("alias").content,
            "<p>rendered by server</p>"
        );
    }

    #[test]
    fn muting_recomputes_visible_projection_only() {
        let mut store = MessageStore::new();
        let mut mention = stream_message(s(3), "noise");
        mention.flags.insert(MessageFlag::Mentioned);
        store.add_messages(vec![
            stream_message(s(1), "noise"),
            stream_message(s(2), "lunch"),
            mention,
        ]);
        store.take_render_signals();

        assert!(store.set_topic_muted(10, "Noise", true));
        assert_eq!(store.visible_ids(), vec![s(2), s(3)]);
        assert_eq!(store.all_ids(), vec![s(1), s(2), s(3)]);
        assert_eq!(store.take_render_signals(), vec![RenderSignal::Rerender]);

        assert!(!store.set_topic_muted(10, "noise", true));
        assert!(store.set_topic_muted(10, "noise", false));
        assert_eq!(store.visible_ids(), vec![s(1), s(2), s(3)]);
    }

    #[test]
    fn wildcard_mentions_stay_visible_in_muted_topics() {
        let mut store = MessageStore::new();
        let mut stream_wide = stream_message(s(2), "noise");
        stream_wide.flags.insert(MessageFlag::StreamWildcardMentioned);
        let mut topic_wide = stream_message(s(3), "noise");
        topic_wide.flags.insert(MessageFlag::TopicWildcardMentioned);
        store.add_messages(vec![stream_message(s(1), "noise"), stream_wide, topic_wide]);

        store.set_topic_muted(10, "noise", true);
        assert_eq!(store.visible_ids(), vec![s(2), s(3)]);
    }

    #[test]
    fn stream_move_drops_stale_stream_name() {
        let mut store = store_with(&[1]);
        store.apply_update(&UpdateMessageEvent {
            message_id: 1,
            message_ids: vec![1],
            stream_id: Some(10),
            new_stream_id: Some(2),
            ..UpdateMessageEvent::default()
        });

        let message = store.get(s(1)).expect("stored");
        match &message.recipient {
            Recipient::Stream {
                stream_id, stream, ..
            } => {
                assert_eq!(*stream_id, 2);
                assert!(stream.is_empty());
            }
            other => panic!("unexpected recipient: {other:?}"),
        }
        assert_eq!(message.edit_history[0].prev_stream, Some(10));
    }

    #[test]
    fn appends_to_muted_topics_stay_hidden() {
        let mut store = store_with(&[1]);
        store.set_topic_muted(10, "hidden", true);
        store.take_render_signals();

        store.add_messages(vec![stream_message(s(2), "hidden")]);
        assert!(store.take_render_signals().is_empty());
        assert_eq!(store.visible_ids(), vec![s(1)]);
        assert!(store.contains(s(2)));
    }

    #[test]
    fn update_changes_content_and_records_history() {
        let mut store = store_with(&[7]);
        let updated = store.apply_update(&UpdateMessageEvent {
            message_id: 7,
            rendered_content: Some("<p>edited</p>".into()),
            content: Some("edited".into()),
            edit_timestamp: Some(5),
            ..UpdateMessageEvent::default()
        });

        assert_eq!(updated, vec![s(7)]);
        let message = store.get(s(7)).expect("stored");
        assert_eq!(message.content, "<p>edited</p>");
        assert_eq!(message.edit_history.len(), 1);
        assert_eq!(
            message.edit_history[0].prev_rendered_content.as_deref(),
            Some("<p>hello</p>")
        );
    }

    #[test]
    fn topic_move_into_muted_topic_hides_messages() {
        let mut store = store_with(&[1, 2]);
        store.set_topic_muted(10, "archive", true);
        store.take_render_signals();

        store.apply_update(&UpdateMessageEvent {
            message_id: 1,
            message_ids: vec![1, 2],
            subject: Some("archive".into()),
            ..UpdateMessageEvent::default()
        });

        assert!(store.visible_ids().is_empty());
        assert_eq!(store.take_render_signals(), vec![RenderSignal::Rerender]);
    }

    #[test]
    fn update_for_unknown_message_is_dropped() {
        let mut store = store_with(&[1]);
        let updated = store.apply_update(&UpdateMessageEvent {
            message_id: 99,
            rendered_content: Some("x".into()),
            ..UpdateMessageEvent::default()
        });
        assert!(updated.is_empty());
        assert!(store.take_render_signals().is_empty());
    }

    #[test]
    fn flag_updates_support_all_messages() {
        let mut store = store_with(&[1, 2, 3]);
        let changed = store.apply_flags(&UpdateMessageFlagsEvent {
            op: FlagOp::Add,
            flag: MessageFlag::Read,
            messages: Vec::new(),
            all: true,
        });
        assert_eq!(changed.len(), 3);

        let changed = store.apply_flags(&UpdateMessageFlagsEvent {
            op: FlagOp::Remove,
            flag: MessageFlag::Read,
            messages: vec![2, 404],
            all: false,
        });
        assert_eq!(changed, vec![s(2)]);
        assert!(!store.get(s(2)).expect("stored").flags.contains(MessageFlag::Read));
    }

    #[test]
    fn removing_selected_message_reselects_closest() {
        let mut store = store_with(&[10, 12, 15]);
        store.select(s(12), SelectPolicy::Exact).expect("select");
        store.take_render_signals();

        let removed = store.remove_messages(&[s(12), s(99)]);

        assert_eq!(removed, vec![s(12)]);
        assert_eq!(store.selected_id(), Some(s(10)));
        assert_eq!(
            store.take_render_signals(),
            vec![
                RenderSignal::Removed(vec![s(12)]),
                RenderSignal::SelectionChanged(Some(s(10))),
            ]
        );
    }

    #[test]
    fn exact_selection_of_missing_message_is_an_error() {
        let mut store = store_with(&[10]);
        let err = store
            .select(s(11), SelectPolicy::Exact)
            .expect_err("missing target");
        assert_eq!(err, StoreError::UnknownMessage(s(11)));
        assert_eq!(
            store.select(s(11), SelectPolicy::Closest),
            Ok(s(10))
        );
        assert_eq!(
            MessageStore::new().select(s(1), SelectPolicy::Closest),
            Err(StoreError::NothingToSelect(s(1)))
        );
    }

    #[test]
    fn submessages_attach_once() {
        let mut store = store_with(&[4]);
        let event = SubmessageEvent {
            message_id: 4,
            submessage_id: 1,
            sender_id: 2,
            msg_type: "widget".into(),
            content: "{}".into(),
        };
        assert_eq!(store.add_submessage(&event), Ok(s(4)));
        assert_eq!(store.add_submessage(&event), Err(StoreError::Duplicate(s(4))));
        assert_eq!(store.get(s(4)).expect("stored").submessages.len(), 1);
    }

    #[test]
    fn max_server_id_ignores_provisional_tail() {
        let mut store = store_with(&[3, 8]);
        store.add_messages(vec![stream_message(pending(8, 1), "lunch")]);
        assert_eq!(store.max_server_id(), Some(8));
    }
}
