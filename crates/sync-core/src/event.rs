//! Typed server events and their decoding from the long-poll payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    ids::MessageId,
    message::{Message, MessageFlag, Submessage},
};

/// Errors produced while turning a raw JSON event into a typed [`Event`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventDecodeError {
    /// The event carried no usable `id`.
    #[error("event is missing a numeric id")]
    MissingId,
    /// The event carried no `type` discriminant.
    #[error("event {id} is missing its type")]
    MissingType { id: u64 },
    /// The payload did not match the shape expected for its type.
    #[error("event {id} of type '{event_type}' is malformed: {reason}")]
    Malformed {
        id: u64,
        event_type: String,
        reason: String,
    },
}

impl EventDecodeError {
    /// Event id, when one could be read.
    pub fn event_id(&self) -> Option<u64> {
        match self {
            Self::MissingId => None,
            Self::MissingType { id } | Self::Malformed { id, .. } => Some(*id),
        }
    }
}

/// A new message delivered by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessageEvent {
    pub message: Message,
    #[serde(default)]
    pub flags: Vec<MessageFlag>,
    /// Provisional id of our own local echo, when this confirms one.
    #[serde(default)]
    pub local_message_id: Option<MessageId>,
}

/// Content and/or topic edit of one or more messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateMessageEvent {
    pub message_id: u64,
    #[serde(default)]
    pub message_ids: Vec<u64>,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub edit_timestamp: Option<i64>,
    /// New markdown source.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub rendered_content: Option<String>,
    #[serde(default)]
    pub orig_content: Option<String>,
    #[serde(default)]
    pub orig_rendered_content: Option<String>,
    #[serde(default, alias = "orig_topic")]
    pub orig_subject: Option<String>,
    #[serde(default, alias = "topic")]
    pub subject: Option<String>,
    #[serde(default)]
    pub stream_id: Option<u64>,
    #[serde(default)]
    pub new_stream_id: Option<u64>,
    #[serde(default)]
    pub propagate_mode: Option<String>,
}

impl UpdateMessageEvent {
    /// Every message touched by the edit, primary id first.
    pub fn affected_ids(&self) -> Vec<u64> {
        let mut ids = vec![self.message_id];
        ids.extend(
            self.message_ids
                .iter()
                .copied()
                .filter(|id| *id != self.message_id),
        );
        ids
    }
}

/// Removal of messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteMessageEvent {
    #[serde(default)]
    pub message_id: Option<u64>,
    #[serde(default)]
    pub message_ids: Vec<u64>,
}

impl DeleteMessageEvent {
    pub fn ids(&self) -> Vec<u64> {
        let mut ids = self.message_ids.clone();
        if let Some(id) = self.message_id
            && !ids.contains(&id)
        {
            ids.push(id);
        }
        ids
    }
}

/// Whether a flag is being set or cleared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagOp {
    Add,
    Remove,
}

/// Flag change for a set of messages (or all of them).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateMessageFlagsEvent {
    #[serde(alias = "operation")]
    pub op: FlagOp,
    pub flag: MessageFlag,
    #[serde(default)]
    pub messages: Vec<u64>,
    #[serde(default)]
    pub all: bool,
}

/// Widget payload appended to an existing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmessageEvent {
    pub message_id: u64,
    pub submessage_id: u64,
    pub sender_id: u64,
    pub msg_type: String,
    pub content: String,
}

impl SubmessageEvent {
    pub fn to_submessage(&self) -> Submessage {
        Submessage {
            id: self.submessage_id,
            message_id: self.message_id,
            sender_id: self.sender_id,
            msg_type: self.msg_type.clone(),
            content: self.content.clone(),
        }
    }
}

/// Server-requested client reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartEvent {
    #[serde(default)]
    pub immediate: bool,
}

/// Per-topic visibility change for the current user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserTopicEvent {
    pub stream_id: u64,
    pub topic_name: String,
    pub visibility_policy: u8,
}

impl UserTopicEvent {
    pub const MUTED: u8 = 1;

    pub fn is_muted(&self) -> bool {
        self.visibility_policy == Self::MUTED
    }
}

/// Non-message state owners that receive forwarded events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventDomain {
    Subscription,
    RealmUser,
    Stream,
    UserGroup,
    Realm,
    UserSettings,
    Typing,
    Presence,
    /// Any type this client does not model; kept so handlers can opt in.
    Other(String),
}

impl EventDomain {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            "subscription" => Self::Subscription,
            "realm_user" => Self::RealmUser,
            "stream" => Self::Stream,
            "user_group" => Self::UserGroup,
            "realm" | "realm_emoji" | "realm_filters" | "realm_linkifiers" => Self::Realm,
            "user_settings" | "update_display_settings" | "update_global_notifications" => {
                Self::UserSettings
            }
            "typing" => Self::Typing,
            "presence" => Self::Presence,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Event payload forwarded verbatim to a domain handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub domain: EventDomain,
    pub event_type: String,
    pub op: Option<String>,
    pub payload: Value,
}

/// Closed set of event shapes the engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message(NewMessageEvent),
    UpdateMessage(UpdateMessageEvent),
    DeleteMessage(DeleteMessageEvent),
    UpdateMessageFlags(UpdateMessageFlagsEvent),
    Submessage(SubmessageEvent),
    UserTopic(UserTopicEvent),
    Restart(RestartEvent),
    Heartbeat,
    Domain(DomainEvent),
}

/// A server-emitted fact with its resume cursor id.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(id: u64, kind: EventKind) -> Self {
        Self { id, kind }
    }

    /// Decode one JSON event object from the `events` array.
    pub fn decode(value: Value) -> Result<Self, EventDecodeError> {
        let Value::Object(mut fields) = value else {
            return Err(EventDecodeError::MissingId);
        };

        let id = fields
            .remove("id")
            .and_then(|id| id.as_u64())
            .ok_or(EventDecodeError::MissingId)?;
        let event_type = match fields.remove("type") {
            Some(Value::String(event_type)) => event_type,
            _ => return Err(EventDecodeError::MissingType { id }),
        };

        let kind = decode_kind(id, &event_type, fields)?;
        Ok(Self { id, kind })
    }
}

fn decode_kind(
    id: u64,
    event_type: &str,
    fields: Map<String, Value>,
) -> Result<EventKind, EventDecodeError> {
    let kind = match event_type {
        "message" => {
            let mut event: NewMessageEvent = decode_payload(id, event_type, fields)?;
            for flag in &event.flags {
                event.message.flags.insert(*flag);
            }
            EventKind::Message(event)
        }
        "update_message" => EventKind::UpdateMessage(decode_payload(id, event_type, fields)?),
        "delete_message" => EventKind::DeleteMessage(decode_payload(id, event_type, fields)?),
        "update_message_flags" => {
            EventKind::UpdateMessageFlags(decode_payload(id, event_type, fields)?)
        }
        "submessage" => EventKind::Submessage(decode_payload(id, event_type, fields)?),
        "user_topic" => EventKind::UserTopic(decode_payload(id, event_type, fields)?),
        "restart" => EventKind::Restart(decode_payload(id, event_type, fields)?),
        "heartbeat" => EventKind::Heartbeat,
        other => {
            let op = fields
                .get("op")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            EventKind::Domain(DomainEvent {
                domain: EventDomain::from_event_type(other),
                event_type: other.to_owned(),
                op,
                payload: Value::Object(fields),
            })
        }
    };
    Ok(kind)
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    id: u64,
    event_type: &str,
    fields: Map<String, Value>,
) -> Result<T, EventDecodeError> {
    serde_json::from_value(Value::Object(fields)).map_err(|err| EventDecodeError::Malformed {
        id,
        event_type: event_type.to_owned(),
        reason: err.to_string(),
    })
}
