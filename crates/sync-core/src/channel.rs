use thiserror::Error;
use tokio::sync::{
    broadcast,
    mpsc::{self, error::TrySendError},
};
use tracing::trace;

use crate::types::{SyncCommand, UiSignal};

/// Signal stream handed to frontend subscribers.
pub type SignalStream = broadcast::Receiver<UiSignal>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncChannelError {
    /// The runtime has exited and dropped its receiver.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The runtime is behind; a non-blocking send was refused.
    #[error("command queue is full")]
    CommandQueueFull,
}

/// Commands into one sync runtime, signals out to any number of frontends.
#[derive(Clone, Debug)]
pub struct SyncChannels {
    command_tx: mpsc::Sender<SyncCommand>,
    signal_tx: broadcast::Sender<UiSignal>,
}

impl SyncChannels {
    /// Returns the channel set and the receiver the runtime drains.
    pub fn new(
        command_buffer: usize,
        signal_buffer: usize,
    ) -> (Self, mpsc::Receiver<SyncCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (signal_tx, _) = broadcast::channel(signal_buffer.max(1));

        (
            Self {
                command_tx,
                signal_tx,
            },
            command_rx,
        )
    }

    pub fn subscribe(&self) -> SignalStream {
        self.signal_tx.subscribe()
    }

    /// Queue a command, waiting for room.
    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }

    /// Queue a command from synchronous code (input handlers) without waiting.
    pub fn try_send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.command_tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => SyncChannelError::CommandQueueFull,
            TrySendError::Closed(_) => SyncChannelError::CommandChannelClosed,
        })
    }

    /// Best-effort fan-out; lagging subscribers see `RecvError::Lagged`.
    pub fn emit(&self, signal: UiSignal) {
        if self.signal_tx.send(signal).is_err() {
            trace!("signal dropped, no subscribers");
        }
    }
}
