use serde::{Deserialize, Serialize};

use crate::{
    error::SyncError, ids::MessageId, message::Recipient, reload::ReloadOptions,
    reload_token::ReloadToken, store::RenderSignal,
};

/// A message the user just sent, shown before the server confirms it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalEchoDraft {
    pub sender_id: u64,
    pub sender_full_name: String,
    pub recipient: Recipient,
    /// Markdown source as typed.
    pub content: String,
    /// Locally rendered HTML, when the client could render it.
    pub rendered_content: Option<String>,
    pub timestamp: i64,
}

/// Result of the send request behind a local echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server stored the message under this id.
    Success { message_id: u64 },
    /// The server rejected the message.
    Failure { error: SyncError },
}

/// Command channel input accepted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncCommand {
    /// Abort the outstanding poll and issue a fresh one.
    RestartPolling {
        /// Ask the server to answer immediately.
        dont_block: bool,
    },
    /// Show a just-sent message under a provisional id.
    LocalEcho(LocalEchoDraft),
    /// Report how the send behind a local echo ended.
    SendOutcome {
        local_id: MessageId,
        outcome: SendOutcome,
    },
    ComposeStarted,
    ComposeFinished,
    /// Keyboard or pointer activity; postpones an idle reload.
    UserActivity,
    SetTopicMuted {
        stream_id: u64,
        topic: String,
        muted: bool,
    },
    /// Move the selection pointer.
    Select {
        id: MessageId,
        /// Fall back to the closest visible message when `id` is missing.
        closest: bool,
    },
    InitiateReload(ReloadOptions),
    /// The page is going away; clean up the server queue.
    Teardown,
}

/// Frontend-facing output broadcast by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UiSignal {
    /// Store change the message list must render.
    Render(RenderSignal),
    /// Persistent connection problem banner.
    ConnectionError { failures: u32 },
    ConnectionRestored,
    /// A reload is scheduled for when the user goes idle.
    ReloadPending { message: Option<String> },
    /// The page is being reloaded; nothing else will be emitted.
    Reloading { immediate: bool },
    /// State carried over from the previous page load, to restore compose.
    SessionRestored(ReloadToken),
    LocalEchoed { local_id: MessageId },
    SendFailed { local_id: MessageId, code: String },
    /// A command could not be carried out.
    CommandFailed(SyncError),
    /// The runtime loop has exited.
    Stopped,
}
