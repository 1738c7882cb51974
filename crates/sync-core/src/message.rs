use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Per-user message flags carried by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageFlag {
    Read,
    Starred,
    Collapsed,
    Mentioned,
    WildcardMentioned,
    StreamWildcardMentioned,
    TopicWildcardMentioned,
    HasAlertWord,
    Historical,
    /// Flags this client does not model.
    #[serde(other)]
    Unknown,
}

/// Set of flags attached to one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MessageFlags(BTreeSet<MessageFlag>);

impl MessageFlags {
    pub fn contains(&self, flag: MessageFlag) -> bool {
        self.0.contains(&flag)
    }

    /// Returns `true` when the flag was not set before.
    pub fn insert(&mut self, flag: MessageFlag) -> bool {
        self.0.insert(flag)
    }

    /// Returns `true` when the flag was set before.
    pub fn remove(&mut self, flag: MessageFlag) -> bool {
        self.0.remove(&flag)
    }

    /// Direct or wildcard mention of the current user.
    pub fn is_mentioned(&self) -> bool {
        [
            MessageFlag::Mentioned,
            MessageFlag::WildcardMentioned,
            MessageFlag::StreamWildcardMentioned,
            MessageFlag::TopicWildcardMentioned,
        ]
        .into_iter()
        .any(|flag| self.contains(flag))
    }
}

impl FromIterator<MessageFlag> for MessageFlags {
    fn from_iter<I: IntoIterator<Item = MessageFlag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One participant of a private conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateRecipient {
    pub id: u64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
}

/// Where a message was sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    Stream {
        stream_id: u64,
        #[serde(rename = "display_recipient", default)]
        stream: String,
        #[serde(rename = "subject")]
        topic: String,
    },
    Private {
        #[serde(rename = "display_recipient", default)]
        recipients: Vec<PrivateRecipient>,
    },
}

impl Recipient {
    /// Stream id and case-folded topic, used for topic muting.
    pub fn topic_key(&self) -> Option<(u64, String)> {
        match self {
            Self::Stream {
                stream_id, topic, ..
            } => Some((*stream_id, topic.to_lowercase())),
            Self::Private { .. } => None,
        }
    }
}

/// Prior state captured by an edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditHistoryEntry {
    pub timestamp: i64,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub prev_content: Option<String>,
    #[serde(default)]
    pub prev_rendered_content: Option<String>,
    #[serde(default, rename = "prev_subject")]
    pub prev_topic: Option<String>,
    #[serde(default)]
    pub prev_stream: Option<u64>,
}

/// Widget payload attached to a message (polls, todo lists, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submessage {
    pub id: u64,
    pub message_id: u64,
    pub sender_id: u64,
    pub msg_type: String,
    pub content: String,
}

/// One chat message as known to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: u64,
    #[serde(default)]
    pub sender_full_name: String,
    #[serde(flatten)]
    pub recipient: Recipient,
    /// Markdown source, when the server or the local echo supplied it.
    #[serde(default)]
    pub raw_content: Option<String>,
    /// Rendered HTML body.
    #[serde(default)]
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default)]
    pub edit_history: Vec<EditHistoryEntry>,
    #[serde(default)]
    pub submessages: Vec<Submessage>,
    #[serde(default)]
    pub locally_echoed: bool,
    /// Set when the optimistic send was rejected.
    #[serde(default)]
    pub failed_request: bool,
}

impl Message {
    pub fn topic_key(&self) -> Option<(u64, String)> {
        self.recipient.topic_key()
    }
}
