mod config;
mod logging;

use std::sync::Arc;

use sync_core::{PollCursor, SignalStream, SyncCommand, SyncEngine, UiSignal};
use sync_http::{Credentials, HttpEventTransport, RuntimeDeps, spawn_runtime};
use sync_platform::{InMemoryPageHost, SystemClock};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let Some((server, queue_id)) = config.live_target() else {
        println!("Set EVENTSYNC_SERVER and EVENTSYNC_QUEUE_ID to poll a live event queue.");
        println!("Optional: EVENTSYNC_EMAIL, EVENTSYNC_API_KEY, EVENTSYNC_LAST_EVENT_ID");
        return;
    };

    let credentials = config
        .email
        .clone()
        .zip(config.api_key.clone())
        .map(|(email, api_key)| Credentials { email, api_key });
    let transport = match HttpEventTransport::new(server, credentials) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "failed to build transport");
            std::process::exit(1);
        }
    };
    info!(events_url = %transport.events_url(), %queue_id, "starting event sync");

    let mut host = InMemoryPageHost::new(config.csrf_token.clone());
    if let Some(fragment) = &config.reload_fragment {
        host = host.with_fragment(fragment.clone());
    }

    let engine = SyncEngine::new(PollCursor::new(queue_id, config.last_event_id), &config.sync);
    let deps = RuntimeDeps {
        transport: Arc::new(transport),
        host: Arc::new(host.clone()),
        clock: Arc::new(SystemClock),
    };
    let (handle, mut signals) = spawn_runtime(engine, deps, &config.sync);

    match config.run_for {
        Some(run_for) => {
            if tokio::time::timeout(run_for, log_signals(&mut signals))
                .await
                .is_err()
            {
                info!(?run_for, "run time elapsed, tearing down");
                if let Err(err) = handle.send(SyncCommand::Teardown).await {
                    warn!(error = %err, "teardown command not delivered");
                }
                log_signals(&mut signals).await;
            }
        }
        None => log_signals(&mut signals).await,
    }

    handle.join().await;
    match host.navigations() {
        Ok(navigations) if !navigations.is_empty() => {
            info!(
                count = navigations.len(),
                "reload requested; restart with EVENTSYNC_RELOAD_FRAGMENT to resume"
            );
            for fragment in navigations {
                println!("{fragment}");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "navigation log unavailable"),
    }
}

/// Log signals until the runtime reports it stopped.
async fn log_signals(signals: &mut SignalStream) {
    loop {
        match signals.recv().await {
            Ok(UiSignal::Stopped) => {
                info!("runtime stopped");
                return;
            }
            Ok(UiSignal::Render(render)) => info!(?render, "render"),
            Ok(UiSignal::ConnectionError { failures }) => {
                warn!(failures, "connection problem")
            }
            Ok(UiSignal::CommandFailed(err)) => warn!(error = %err, "command failed"),
            Ok(signal) => info!(?signal, "signal"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "signal stream lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
