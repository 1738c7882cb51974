//! HTTP long-poll transport and the tokio loop that drives a [`sync_core::SyncEngine`].
//!
//! The engine decides; this crate performs requests, owns the retry and
//! watchdog timers, and hands the page host its reload fragment.

mod runtime;
mod transport;

pub use runtime::{RuntimeDeps, SyncRuntimeHandle, spawn_runtime};
pub use transport::{Credentials, EventTransport, HttpEventTransport, TransportError};
