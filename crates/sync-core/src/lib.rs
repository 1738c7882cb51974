//! Client-side real-time event synchronization engine.
//!
//! This crate holds the protocol and state logic only: identifiers, the
//! message/event model, the ordered message store, event dispatch, the
//! long-poll state machine, backoff, and reload coordination. Network and
//! timers live in `sync-http`.

/// Async command/signal channel primitives.
pub mod channel;
/// Poll and reload tuning knobs.
pub mod config;
/// Batch routing to the store and domain handlers.
pub mod dispatch;
/// The per-session aggregate.
pub mod engine;
/// Stable engine error types and HTTP classification helpers.
pub mod error;
/// Typed server events.
pub mod event;
/// Server and provisional message identifiers.
pub mod ids;
/// Message entity.
pub mod message;
/// Long-poll state machine.
pub mod poller;
/// Reload coordination.
pub mod reload;
/// Reload token URL fragment codec.
pub mod reload_token;
/// Backoff policy used by the poll loop.
pub mod retry;
/// Ordered message cache.
pub mod store;
/// Frontend-facing protocol types (commands, signals, payloads).
pub mod types;

pub use channel::{SignalStream, SyncChannelError, SyncChannels};
pub use config::SyncConfig;
pub use dispatch::{DispatchReport, DomainHandler, EventDispatcher, EventFailure, HandlerError};
pub use engine::{EngineEffect, SyncEngine};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use event::{DomainEvent, Event, EventDecodeError, EventDomain, EventKind};
pub use ids::{MessageId, MessageIdError, PendingId, PendingIdAllocator};
pub use message::{Message, MessageFlag, MessageFlags, Recipient};
pub use poller::{EventPoller, PollCursor, PollFailure, PollRequest, PollerAction, PollerState};
pub use reload::{ReloadCoordinator, ReloadOptions, ReloadState, SessionSnapshot};
pub use reload_token::{ComposeDraft, ComposeTarget, ReloadToken, ReloadTokenError, ReloadTokenSlot};
pub use retry::RetryPolicy;
pub use store::{InsertReport, InsertShape, MessageStore, RenderSignal, SelectPolicy, StoreError};
pub use types::{LocalEchoDraft, SendOutcome, SyncCommand, UiSignal};
