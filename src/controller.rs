//! Command controller
//!
//! Wires the collaborators into running tasks and exposes the external command
//! surface: `start`, `stop`, `pause`, `resume` and `run_health_check_now`.
//!
//! # Tasks
//! - One poller task, driven by the [`RunState`] watch channel
//! - `pipeline.workers` pipeline workers draining the cycle queue
//! - One health monitor task
//! - The alarm dispatcher's per-target worker pools
//!
//! Every command is idempotent and only publishes a new run state; the tasks react to
//! it. Pausing or stopping lets the tick in progress finish, then discards in-flight
//! cycle buffers.
//!
//! # Shutdown
//! 1. Publish `ShutDown` and wait for the poller to finish its tick
//! 2. Close the cycle queue and let the workers drain it
//! 3. Give the alarm dispatcher its grace period, then abandon deliveries
//! 4. Wait for the health monitor to exit

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::acquisition::{ChannelView, CycleQueue, Poller, PollerSettings, PollerStatus};
use crate::alarm::{AlarmDispatcher, AlarmTarget, DeliveryPolicy, DispatcherSettings};
use crate::config::MonitorConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::MonitorResult;
use crate::health::{FaultReport, HealthHandle, HealthMonitor, HealthSettings, HealthSources};
use crate::link::{self, ProtocolLink};
use crate::pipeline::classifier::{self, Classifier};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::storage::{self, Storage};

/// Acquisition run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not sampling, link released
    Stopped,
    /// Sampling at the configured period
    Running,
    /// Not sampling, link kept open
    Paused,
    /// Terminal; every task is exiting
    ShutDown,
}

impl RunState {
    /// `start` is accepted from here
    pub fn can_start(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Paused)
    }

    /// `pause` is accepted from here
    pub fn can_pause(self) -> bool {
        self == RunState::Running
    }

    /// `resume` is accepted from here
    pub fn can_resume(self) -> bool {
        self == RunState::Paused
    }

    /// `stop` is accepted from here
    pub fn can_stop(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

/// Value published on the run-state watch channel.
///
/// `halts` increases on every transition to a state other than `Running`, so a
/// pause stays observable after a later resume overwrites `state` before the
/// poller reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunControl {
    /// Current run state
    pub state: RunState,
    /// Number of pause, stop and shutdown transitions so far
    pub halts: u64,
}

impl RunControl {
    /// Initial value in `state` with no halts recorded
    pub fn new(state: RunState) -> Self {
        Self { state, halts: 0 }
    }

    /// Move to `to`, counting a halt when `to` is not `Running`
    pub fn advance(self, to: RunState) -> Self {
        let halts = if to == RunState::Running {
            self.halts
        } else {
            self.halts + 1
        };
        Self { state: to, halts }
    }

    /// True if a halt happened between `earlier` and `self`
    pub fn halted_since(&self, earlier: &RunControl) -> bool {
        self.halts != earlier.halts
    }
}

/// Point-in-time view printed by the console `d` command
#[derive(Debug, Clone, Serialize)]
pub struct MonitorDiagnostics {
    /// Current run state
    pub run_state: RunState,
    /// Global counters
    pub counters: DiagnosticsSnapshot,
    /// Completed cycles waiting for a pipeline worker
    pub queued_cycles: usize,
    /// Failed ticks since the last successful read
    pub consecutive_link_failures: u32,
    /// Per-channel detector state after the latest tick
    pub channels: Vec<ChannelView>,
}

/// External collaborators the monitor runs against
pub struct Collaborators {
    /// PLC link
    pub link: Arc<dyn ProtocolLink>,
    /// Cycle classifier
    pub classifier: Arc<dyn Classifier>,
    /// Record storage
    pub storage: Arc<dyn Storage>,
    /// Alarm targets with their delivery policies
    pub alarm_targets: Vec<(Arc<dyn AlarmTarget>, DeliveryPolicy)>,
}

impl Collaborators {
    /// Build the collaborators named by configuration
    pub fn from_config(config: &MonitorConfig) -> MonitorResult<Self> {
        Ok(Self {
            link: link::from_config(&config.link),
            classifier: Arc::from(classifier::from_config(config.model.path.as_deref())),
            storage: storage::from_config(&config.storage)?,
            alarm_targets: AlarmDispatcher::http_targets(&config.alarm),
        })
    }
}

struct Tasks {
    poller: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    health: JoinHandle<()>,
}

/// Handle to a running monitor
pub struct Monitor {
    state: watch::Sender<RunControl>,
    diagnostics: Arc<Diagnostics>,
    queue: Arc<CycleQueue>,
    alarms: Arc<AlarmDispatcher>,
    health: HealthHandle,
    poller_status: Arc<PollerStatus>,
    tasks: Mutex<Option<Tasks>>,
}

impl Monitor {
    /// Spawn every task in the `Stopped` state. Must be called inside a Tokio runtime.
    pub fn spawn(config: &MonitorConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            link,
            classifier,
            storage,
            alarm_targets,
        } = collaborators;

        let diagnostics = Arc::new(Diagnostics::new());
        let (state, state_rx) = watch::channel(RunControl::new(RunState::Stopped));
        let alarms = Arc::new(AlarmDispatcher::new(
            DispatcherSettings::from(&config.alarm),
            alarm_targets,
            diagnostics.clone(),
        ));

        let queue = Arc::new(CycleQueue::new(
            config.pipeline.queue_capacity,
            config.pipeline.overflow_policy,
        ));
        let poller_status = Arc::new(PollerStatus::new());
        let poller = Poller::new(
            link.clone(),
            PollerSettings {
                link: config.link.clone(),
                polling: config.polling.clone(),
                cycle: config.cycle.clone(),
            },
            queue.clone(),
            diagnostics.clone(),
            poller_status.clone(),
        );

        let pipeline = Arc::new(Pipeline::new(
            PipelineSettings::from_config(&config.pipeline, &config.link),
            classifier.clone(),
            link.clone(),
            storage.clone(),
            alarms.clone(),
            diagnostics.clone(),
        ));

        let (health_monitor, health) = HealthMonitor::new(
            HealthSettings {
                health: config.health.clone(),
                polling: config.polling.clone(),
                fault_register: config.link.write_back.clone(),
                write_timeout: config.link.write_timeout(),
                channel_count: config.link.layout.channel_count,
            },
            HealthSources {
                link,
                poller: poller_status.clone(),
                classifier,
                storage,
                diagnostics: diagnostics.clone(),
                run_state: state_rx.clone(),
            },
            alarms.clone(),
        );

        let tasks = Tasks {
            poller: tokio::spawn(poller.run(state_rx)),
            workers: pipeline.spawn_workers(queue.clone(), config.pipeline.workers),
            health: tokio::spawn(health_monitor.run()),
        };
        tracing::info!(
            channels = config.link.layout.channel_count,
            workers = config.pipeline.workers,
            alarm_targets = alarms.target_count(),
            "Monitor ready"
        );

        Self {
            state,
            diagnostics,
            queue,
            alarms,
            health,
            poller_status,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    /// Build collaborators from configuration and spawn
    pub fn from_config(config: &MonitorConfig) -> MonitorResult<Self> {
        let collaborators = Collaborators::from_config(config)?;
        Ok(Self::spawn(config, collaborators))
    }

    /// Current run state
    pub fn run_state(&self) -> RunState {
        self.state.borrow().state
    }

    /// Subscribe to run-state changes
    pub fn subscribe_state(&self) -> watch::Receiver<RunControl> {
        self.state.subscribe()
    }

    /// Start acquisition, or resume it when paused
    pub fn start(&self) -> RunState {
        self.transition("start", RunState::can_start, RunState::Running)
    }

    /// Halt acquisition, discard in-flight cycles and release the link
    pub fn stop(&self) -> RunState {
        self.transition("stop", RunState::can_stop, RunState::Stopped)
    }

    /// Halt acquisition and discard in-flight cycles, keeping the link open
    pub fn pause(&self) -> RunState {
        self.transition("pause", RunState::can_pause, RunState::Paused)
    }

    /// Resume a paused monitor
    pub fn resume(&self) -> RunState {
        self.transition("resume", RunState::can_resume, RunState::Running)
    }

    fn transition(&self, command: &str, allowed: fn(RunState) -> bool, to: RunState) -> RunState {
        let mut from = RunState::Stopped;
        let changed = self.state.send_if_modified(|control| {
            from = control.state;
            if allowed(control.state) {
                *control = control.advance(to);
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!(command, ?from, ?to, "Run state changed");
        } else {
            tracing::debug!(command, state = ?from, "Command ignored in current state");
        }
        self.run_state()
    }

    /// Probe health now and return the fresh report
    pub async fn run_health_check_now(&self) -> MonitorResult<Arc<FaultReport>> {
        self.health.probe_now().await
    }

    /// Latest published health report
    pub fn health_report(&self) -> Arc<FaultReport> {
        self.health.latest()
    }

    /// Handle to the health monitor task
    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    /// Global diagnostic counters
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Counters plus per-channel detector state and queue depth
    pub fn diagnostics_report(&self) -> MonitorDiagnostics {
        MonitorDiagnostics {
            run_state: self.run_state(),
            counters: self.diagnostics.snapshot(),
            queued_cycles: self.queue.len(),
            consecutive_link_failures: self.poller_status.consecutive_failures(),
            channels: self.poller_status.channels(),
        }
    }

    /// Link and liveness state published by the poller
    pub fn poller_status(&self) -> &PollerStatus {
        &self.poller_status
    }

    /// Cycles waiting for a pipeline worker
    pub fn queued_cycles(&self) -> usize {
        self.queue.len()
    }

    /// Stop every task in order. Later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };
        self.state
            .send_modify(|control| *control = control.advance(RunState::ShutDown));
        tracing::info!("Shutting down");

        if let Err(e) = tasks.poller.await {
            tracing::error!(error = %e, "Poller task failed");
        }

        self.queue.close();
        let pending = self.queue.len();
        if pending > 0 {
            tracing::info!(pending, "Draining cycle queue");
        }
        for result in futures::future::join_all(tasks.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pipeline worker failed");
            }
        }

        self.alarms.shutdown().await;

        if let Err(e) = tasks.health.await {
            tracing::error!(error = %e, "Health monitor task failed");
        }
        tracing::info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_only_from_running() {
        assert!(RunState::Running.can_pause());
        assert!(!RunState::Paused.can_pause());
        assert!(!RunState::Stopped.can_pause());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let state = RunState::ShutDown;
        assert!(!state.can_start());
        assert!(!state.can_stop());
        assert!(!state.can_resume());
    }

    #[test]
    fn test_halts_count_every_halt() {
        let control = RunControl::new(RunState::Stopped);
        let running = control.advance(RunState::Running);
        assert!(!running.halted_since(&control));

        // Pause then resume before anyone looks: the pause is still visible
        let resumed = running.advance(RunState::Paused).advance(RunState::Running);
        assert_eq!(resumed.state, RunState::Running);
        assert!(resumed.halted_since(&running));
        assert_eq!(resumed.advance(RunState::ShutDown).halts, 2);
    }

    #[test]
    fn test_start_covers_resume() {
        assert!(RunState::Paused.can_start());
        assert!(RunState::Paused.can_resume());
        assert!(!RunState::Stopped.can_resume());
    }
}
