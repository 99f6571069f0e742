//! Daemon wiring: builds the engine from configuration and runs the
//! trigger sources, the trigger loop and the status API until shutdown.

pub mod shutdown;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::notify::BroadcastNotifier;
use crate::probe::SysinfoProcessProbe;
use crate::store::SqliteStateStore;
use crate::utils::errors::{AgentError, Result};
use crate::ws::{self, EventBus};
use mirror_engine::ports::SystemClock;
use mirror_engine::trigger::{self, watch_host_wake, watch_source_process};
use mirror_engine::{
    AttemptOutcome, LifecycleEvent, LocalFileSystem, LogBuffer, SyncDeps, SyncOrchestrator, Trigger, TriggerLoop,
};
use shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Engine and adapters built from configuration
pub struct Components {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub probe: Arc<SysinfoProcessProbe>,
    pub events: EventBus,
}

impl Components {
    pub fn build(config: &Config) -> Result<Self> {
        let machine = config.machine_id()?;
        let store = SqliteStateStore::open(&config.paths.state_db)?;
        let events = EventBus::new();
        let notifier = BroadcastNotifier::new(events.clone(), config.notify.command.clone());
        let probe = Arc::new(SysinfoProcessProbe::new(config.source_app.process_name.trim()));

        let orchestrator = SyncOrchestrator::new(
            machine,
            config.engine_settings(),
            SyncDeps {
                fs: Arc::new(LocalFileSystem::with_walk_options(config.walk_options())),
                store: Arc::new(store),
                notifier: Arc::new(notifier),
                probe: probe.clone(),
                clock: Arc::new(SystemClock),
            },
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            probe,
            events,
        })
    }
}

/// Run a single attempt and report its outcome.
pub async fn run_once(components: &Components) -> Result<()> {
    match components.orchestrator.attempt_sync(Trigger::Manual).await {
        AttemptOutcome::Succeeded(report) => {
            info!("Snapshot written to {}", report.snapshot.path.display());
            for warning in &report.warnings {
                warn!("{}", warning);
            }
            Ok(())
        }
        AttemptOutcome::Failed(err) => Err(err.into()),
        AttemptOutcome::Skipped => Ok(()),
    }
}

/// Run until SIGINT or SIGTERM.
pub async fn run(config: &Config, components: Components, logs: LogBuffer) -> Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    let orchestrator = components.orchestrator;
    let poll_interval = Duration::from_secs(config.sync.poll_interval_secs);

    let (feed, rx) = trigger::channel();

    let trigger_handle = tokio::spawn(TriggerLoop::new(orchestrator.clone(), rx).run(cancel.clone()));

    let process_handle = tokio::spawn(watch_source_process(
        components.probe.clone(),
        feed.clone(),
        poll_interval,
        cancel.clone(),
    ));

    let wake_handle = tokio::spawn(watch_host_wake(
        orchestrator.clock().clone(),
        feed.clone(),
        poll_interval,
        Duration::from_secs(config.sync.wake_threshold_secs),
        cancel.clone(),
    ));

    let status_handle = tokio::spawn(ws::forward_status(
        orchestrator.subscribe(),
        components.events.clone(),
        cancel.clone(),
    ));

    let server_handle = if config.api.enabled {
        let addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
            .parse()
            .map_err(|e| AgentError::Config(format!("invalid api address: {e}")))?;
        let state = AppState::new(orchestrator.clone(), feed.clone(), logs, components.events.clone());
        let app = api::create_router(state);
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("Listening on http://{}", addr);
        info!("Status endpoint: http://{}/status", addr);
        info!("WebSocket endpoint: ws://{}/ws", addr);

        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(server_cancel.cancelled_owned());
            if let Err(e) = server.await {
                error!("Server error: {}", e);
            }
        }))
    } else {
        None
    };

    if config.sync.sync_on_start {
        if let Err(e) = feed.emit(LifecycleEvent::Startup).await {
            warn!("Startup sync not queued: {}", e);
        }
    }
    drop(feed);

    shutdown.wait_for_signal().await?;
    info!("Graceful shutdown initiated");

    shutdown.join("Process watcher", process_handle, Duration::from_secs(3)).await;
    shutdown.join("Wake detector", wake_handle, Duration::from_secs(3)).await;
    shutdown.join("Status forwarder", status_handle, Duration::from_secs(3)).await;
    if let Some(handle) = server_handle {
        shutdown.join("HTTP server", handle, Duration::from_secs(5)).await;
    }

    // A running copy is never cut short
    if let Err(e) = trigger_handle.await {
        error!("Trigger loop task failed: {}", e);
    }

    info!("Graceful shutdown complete");
    Ok(())
}
