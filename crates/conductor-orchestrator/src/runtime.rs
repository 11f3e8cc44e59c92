use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::config_watcher::ConfigWatcher;
use crate::coordinator::Coordinator;
use crate::events::EventLog;
use crate::scaling::{AgentLifecycle, ScalingController};
use crate::types::Assignment;
use conductor_core::{ConductorError, ConductorResult};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Assignments buffered for the agent execution runtime.
pub const ASSIGNMENT_BUFFER: usize = 256;

/// Debounce for config file changes.
const CONFIG_DEBOUNCE_MS: u64 = 500;

/// The running orchestrator: one coordinator and scaling controller driven
/// by four background loops (assignment, health, sweep, scaling).
pub struct OrchestratorRuntime {
    coordinator: Arc<Coordinator>,
    scaling: Arc<ScalingController>,
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    event_log: Option<EventLog>,
    watcher: Option<ConfigWatcher>,
}

impl OrchestratorRuntime {
    /// Start on the wall clock. Assignments are delivered on the returned
    /// channel.
    pub fn start(
        config: OrchestratorConfig,
        lifecycle: Arc<dyn AgentLifecycle>,
    ) -> ConductorResult<(Self, mpsc::Receiver<Assignment>)> {
        Self::start_with_clock(config, lifecycle, Arc::new(SystemClock))
    }

    /// Start on an injected clock.
    pub fn start_with_clock(
        config: OrchestratorConfig,
        lifecycle: Arc<dyn AgentLifecycle>,
        clock: Arc<dyn Clock>,
    ) -> ConductorResult<(Self, mpsc::Receiver<Assignment>)> {
        let coordinator = Arc::new(Coordinator::with_clock(config.clone(), clock)?);
        let scaling = Arc::new(ScalingController::new(
            coordinator.clone(),
            lifecycle,
            config.scaling_policy(),
        ));
        let (shutdown, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ASSIGNMENT_BUFFER);

        let mut loops = Vec::with_capacity(4);
        loops.push(tokio::spawn(assignment_loop(
            coordinator.clone(),
            tx,
            Duration::from_millis(config.assignment_interval_ms),
            shutdown.subscribe(),
        )));

        let health = coordinator.clone();
        loops.push(tokio::spawn(every(
            Duration::from_secs(config.health_check_interval),
            shutdown.subscribe(),
            move || {
                let health = health.clone();
                async move {
                    match health.check_health() {
                        Ok(report) if !report.is_empty() => {
                            info!(
                                degraded = report.degraded.len(),
                                offline = report.offline.len(),
                                requeued = report.requeued.len(),
                                removed = report.removed.len(),
                                "Health check"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Health check failed"),
                    }
                }
            },
        )));

        let sweeper = coordinator.clone();
        loops.push(tokio::spawn(every(
            Duration::from_secs(config.sweep_interval),
            shutdown.subscribe(),
            move || {
                let sweeper = sweeper.clone();
                async move {
                    match sweeper.sweep() {
                        Ok(report) => debug!(
                            expired = report.expired.len(),
                            cancelled = report.cancelled.len(),
                            purged = report.purged,
                            "Sweep"
                        ),
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            },
        )));

        let scaler = scaling.clone();
        loops.push(tokio::spawn(every(
            Duration::from_secs(config.scaling_interval),
            shutdown.subscribe(),
            move || {
                let scaler = scaler.clone();
                async move {
                    if let Err(e) = scaler.evaluate().await {
                        warn!(error = %e, "Scaling evaluation failed");
                    }
                }
            },
        )));

        info!(
            strategy = %config.load_balancing_strategy,
            min_agents = config.min_agents,
            max_agents = config.max_agents,
            "Orchestrator started"
        );
        Ok((
            Self {
                coordinator,
                scaling,
                shutdown,
                loops,
                event_log: None,
                watcher: None,
            },
            rx,
        ))
    }

    /// The shared coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The scaling controller.
    pub fn scaling(&self) -> &Arc<ScalingController> {
        &self.scaling
    }

    /// Persist every event as JSON lines under `log_dir`.
    pub fn enable_event_log(&mut self, log_dir: PathBuf) {
        if self.event_log.is_none() {
            self.event_log = Some(EventLog::spawn(log_dir, self.coordinator.events()));
        }
    }

    /// Reload scaling policy and load-balancing strategy when `path` changes.
    pub fn watch_config(&mut self, path: PathBuf) -> ConductorResult<()> {
        let scaling = self.scaling.clone();
        let coordinator = self.coordinator.clone();
        let watcher = ConfigWatcher::start(path, CONFIG_DEBOUNCE_MS, move |config| {
            if let Err(e) = scaling.update_policy(config.scaling_policy()) {
                warn!(error = %e, "Reloaded scaling policy rejected");
                return;
            }
            coordinator.set_strategy(config.load_balancing_strategy);
        })?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop accepting submissions, let the loops finish their current pass,
    /// and wait for them.
    pub async fn shutdown(self) {
        info!("Orchestrator shutting down");
        self.coordinator.close();
        drop(self.watcher);
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop ended abnormally");
            }
        }
        if let Some(log) = self.event_log {
            log.stop().await;
        }
        info!("Orchestrator stopped");
    }
}

/// Drain ready work whenever the queue signals or the fallback tick fires.
async fn assignment_loop(
    coordinator: Arc<Coordinator>,
    tx: mpsc::Sender<Assignment>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let signal = coordinator.ready_signal();
    let mut timer = tokio::time::interval(tick);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = signal.notified() => {}
            _ = timer.tick() => {}
        }

        while !*shutdown.borrow() {
            match coordinator.assign_next() {
                Ok(assignment) => {
                    if let Err(mpsc::error::SendError(undelivered)) = tx.send(assignment).await {
                        warn!("Assignment receiver dropped; assignment loop exiting");
                        if let Err(e) = coordinator.revoke_assignment(undelivered.task_id) {
                            error!(
                                task_id = %undelivered.task_id,
                                error = %e,
                                "Revoking undelivered assignment failed"
                            );
                        }
                        return;
                    }
                }
                Err(
                    ConductorError::NoReadyTask
                    | ConductorError::NoEligibleAgent
                    | ConductorError::InsufficientResources(_),
                ) => break,
                Err(e) => {
                    error!(error = %e, "Assignment failed");
                    break;
                }
            }
        }
    }
    debug!("Assignment loop stopped");
}

/// Run `tick` on a fixed period until shutdown.
async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => tick().await,
        }
    }
}
