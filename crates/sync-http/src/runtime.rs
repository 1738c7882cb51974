use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde_json::Value;
use sync_core::{
    EngineEffect, PollRequest, ReloadOptions, SessionSnapshot, SignalStream, SyncChannelError,
    SyncChannels, SyncCommand, SyncConfig, SyncEngine, SyncError, SyncErrorCategory, UiSignal,
};
use sync_platform::{Clock, PageHost};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::transport::{EventTransport, TransportError};

const RELOAD_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Collaborators the runtime drives.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub transport: Arc<dyn EventTransport>,
    pub host: Arc<dyn PageHost>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug)]
pub struct SyncRuntimeHandle {
    channels: SyncChannels,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncRuntimeHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> SignalStream {
        self.channels.subscribe()
    }

    /// Non-blocking variant of [`Self::send`] for input handlers.
    pub fn try_send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.try_send_command(command)
    }

    /// Stop the loop without tearing down the server queue.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }

    /// Wait for the loop to exit on its own (teardown or reload).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn the poll loop for `engine`.
///
/// The returned stream is subscribed before the loop starts, so it sees every
/// signal including the first render.
pub fn spawn_runtime(
    engine: SyncEngine,
    deps: RuntimeDeps,
    config: &SyncConfig,
) -> (SyncRuntimeHandle, SignalStream) {
    let (channels, command_rx) = SyncChannels::new(128, 512);
    let signals = channels.subscribe();
    let stop = CancellationToken::new();
    let runtime = SyncRuntime::new(
        engine,
        deps,
        channels.clone(),
        command_rx,
        stop.child_token(),
        config.watchdog_period,
    );
    let task = tokio::spawn(async move {
        runtime.run().await;
    });

    (
        SyncRuntimeHandle {
            channels,
            stop,
            task,
        },
        signals,
    )
}

struct PollOutcome {
    generation: u64,
    result: Result<Vec<Value>, TransportError>,
}

struct InFlightPoll {
    generation: u64,
    cancel: CancellationToken,
}

struct SyncRuntime {
    engine: SyncEngine,
    deps: RuntimeDeps,
    channels: SyncChannels,
    command_rx: mpsc::Receiver<SyncCommand>,
    poll_tx: mpsc::UnboundedSender<PollOutcome>,
    poll_rx: mpsc::UnboundedReceiver<PollOutcome>,
    stop: CancellationToken,
    watchdog_period: Duration,
    in_flight: Option<InFlightPoll>,
    generation: u64,
    retry_at: Option<Instant>,
    finished: bool,
}

impl SyncRuntime {
    fn new(
        engine: SyncEngine,
        deps: RuntimeDeps,
        channels: SyncChannels,
        command_rx: mpsc::Receiver<SyncCommand>,
        stop: CancellationToken,
        watchdog_period: Duration,
    ) -> Self {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            deps,
            channels,
            command_rx,
            poll_tx,
            poll_rx,
            stop,
            watchdog_period: watchdog_period.max(Duration::from_millis(1)),
            in_flight: None,
            generation: 0,
            retry_at: None,
            finished: false,
        }
    }

    async fn run(mut self) {
        let effects = self.bootstrap();
        self.apply(effects).await;

        let start = Instant::now();
        let mut watchdog = interval_at(start + self.watchdog_period, self.watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reload_tick = interval_at(start + RELOAD_TICK_PERIOD, RELOAD_TICK_PERIOD);
        reload_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished {
            let retry_at = self.retry_at;
            let effects = tokio::select! {
                _ = self.stop.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("command channel closed");
                        break;
                    }
                },
                Some(outcome) = self.poll_rx.recv() => self.on_poll_outcome(outcome),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.engine.retry_elapsed()
                }
                _ = watchdog.tick() => self.engine.watchdog_sample(self.deps.clock.now_ms()),
                _ = reload_tick.tick() => self.engine.tick_reload(self.deps.clock.now_ms()),
            };
            self.apply(effects).await;
        }

        self.cancel_poll();
        info!("sync runtime stopped");
        self.channels.emit(UiSignal::Stopped);
    }

    fn bootstrap(&mut self) -> Vec<EngineEffect> {
        match self.restore_session() {
            Ok(Some(token)) => self.channels.emit(UiSignal::SessionRestored(token)),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "starting without restored session");
                self.channels.emit(UiSignal::CommandFailed(err));
            }
        }

        match self.engine.start() {
            Ok(effects) => effects,
            Err(err) => {
                error!(error = %err, "sync engine failed to start");
                self.channels.emit(UiSignal::CommandFailed(err));
                self.finished = true;
                Vec::new()
            }
        }
    }

    fn restore_session(&mut self) -> Result<Option<sync_core::ReloadToken>, SyncError> {
        let host_error = |err: sync_platform::PlatformError| {
            SyncError::new(SyncErrorCategory::Config, "page_host_error", err.to_string())
        };
        let mut slot = self.deps.host.reload_slot().map_err(host_error)?;
        if !slot.is_present() {
            return Ok(None);
        }
        let csrf_token = self.deps.host.csrf_token().map_err(host_error)?;
        self.engine.restore_from_reload(&mut slot, &csrf_token)
    }

    fn on_command(&mut self, command: SyncCommand) -> Vec<EngineEffect> {
        trace!(?command, "command received");
        if matches!(command, SyncCommand::Teardown) {
            self.finished = true;
        }
        match self.engine.handle_command(command, self.deps.clock.now_ms()) {
            Ok(effects) => effects,
            Err(err) => {
                warn!(error = %err, "command failed");
                vec![EngineEffect::Signal(UiSignal::CommandFailed(err))]
            }
        }
    }

    fn on_poll_outcome(&mut self, outcome: PollOutcome) -> Vec<EngineEffect> {
        let current = self.in_flight.as_ref().map(|poll| poll.generation);
        if current != Some(outcome.generation) {
            trace!(generation = outcome.generation, "stale poll result dropped");
            return Vec::new();
        }
        self.in_flight = None;

        let now_ms = self.deps.clock.now_ms();
        match outcome.result {
            Ok(events) => self.engine.handle_events(events, now_ms),
            Err(err) => {
                debug!(error = %err, "poll failed");
                self.engine
                    .handle_poll_failure(err.into_poll_failure(), now_ms)
            }
        }
    }

    async fn apply(&mut self, effects: Vec<EngineEffect>) {
        let mut queue: VecDeque<EngineEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                EngineEffect::IssuePoll(request) => self.issue_poll(request),
                EngineEffect::AbortPoll => self.cancel_poll(),
                EngineEffect::ScheduleRetry { delay } => {
                    self.retry_at = Some(Instant::now() + delay);
                }
                EngineEffect::CancelRetry => self.retry_at = None,
                EngineEffect::RunDeferred => {
                    tokio::task::yield_now().await;
                    queue.extend(self.engine.run_deferred());
                }
                EngineEffect::DeleteQueue { queue_id } => {
                    delete_queue(Arc::clone(&self.deps.transport), queue_id).await
                }
                EngineEffect::Reload(options) => self.reload(options).await,
                EngineEffect::Signal(signal) => self.channels.emit(signal),
            }
        }
    }

    fn issue_poll(&mut self, request: PollRequest) {
        self.cancel_poll();
        self.generation += 1;
        let generation = self.generation;
        let cancel = self.stop.child_token();
        let token = cancel.clone();
        let transport = Arc::clone(&self.deps.transport);
        let poll_tx = self.poll_tx.clone();
        debug!(
            generation,
            last_event_id = request.last_event_id,
            dont_block = request.dont_block,
            "issuing poll"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = transport.get_events(&request) => {
                    let _ = poll_tx.send(PollOutcome { generation, result });
                }
            }
        });
        self.in_flight = Some(InFlightPoll { generation, cancel });
    }

    fn cancel_poll(&mut self) {
        if let Some(poll) = self.in_flight.take() {
            debug!(generation = poll.generation, "aborting outstanding poll");
            poll.cancel.cancel();
        }
    }

    async fn reload(&mut self, options: ReloadOptions) {
        self.retry_at = None;
        self.cancel_poll();

        let snapshot = match self.deps.host.capture_session() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "session snapshot unavailable, reloading without it");
                SessionSnapshot {
                    csrf_token: self.deps.host.csrf_token().unwrap_or_default(),
                    ..SessionSnapshot::default()
                }
            }
        };
        let fragment = self.engine.reload_fragment(&options, snapshot);

        for effect in self.engine.teardown() {
            if let EngineEffect::DeleteQueue { queue_id } = effect {
                delete_queue(Arc::clone(&self.deps.transport), queue_id).await;
            }
        }

        if let Err(err) = self.deps.host.navigate_reload(&fragment) {
            error!(error = %err, "reload navigation failed");
            self.channels.emit(UiSignal::CommandFailed(SyncError::new(
                SyncErrorCategory::Config,
                "reload_navigation_failed",
                err.to_string(),
            )));
        }
        self.finished = true;
    }
}

/// Best-effort `DELETE` of the server queue.
async fn delete_queue(transport: Arc<dyn EventTransport>, queue_id: String) {
    if let Err(err) = transport.delete_queue(&queue_id).await {
        warn!(%queue_id, error = %err, "queue cleanup failed");
    }
}
