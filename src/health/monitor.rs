//! Health monitor
//!
//! Runs its own periodic probe, independent of the sampling period. Each probe
//! evaluates the enabled checks, reconciles the observations with the active-fault
//! map and publishes an immutable [`FaultReport`] snapshot.
//!
//! - The active-fault map is owned by the monitor task and mutated only by `probe`
//! - Readers get `Arc<FaultReport>` snapshots through a `watch` channel
//! - A new fault, or one whose severity rose, is pushed as an alarm when it meets
//!   the configured minimum severity
//! - A fault that stops reproducing is resolved; a resolution notice is pushed only
//!   when `notify_on_resolve` is set
//! - The monitor never restarts anything; it only reports

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::fault::{
    CheckOutcome, CheckResult, FaultCode, FaultRecord, FaultReport, OverallStatus, Severity,
};
use crate::acquisition::PollerStatus;
use crate::alarm::{AlarmDispatcher, AlarmRequest};
use crate::config::{HealthConfig, PollingConfig};
use crate::controller::{RunControl, RunState};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::{MonitorError, MonitorResult, StorageError};
use crate::link::layout::ResultEncoding;
use crate::link::{with_timeout, ChannelId, ProtocolLink};
use crate::pipeline::classifier::Classifier;
use crate::storage::Storage;

/// Settings the monitor needs
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Checks, thresholds and alarm policy
    pub health: HealthConfig,
    /// Poll period and backoff, for the liveness allowance
    pub polling: PollingConfig,
    /// Where the worst active fault code is written
    pub fault_register: ResultEncoding,
    /// Timeout for the fault register write
    pub write_timeout: Duration,
    /// Channels covered by the staleness check
    pub channel_count: u16,
}

/// Everything the probe reads
#[derive(Clone)]
pub struct HealthSources {
    /// PLC link, also used for the fault register
    pub link: Arc<dyn ProtocolLink>,
    /// Poller heartbeat and failure count
    pub poller: Arc<PollerStatus>,
    /// Classifier, for the loaded check
    pub classifier: Arc<dyn Classifier>,
    /// Storage, for reachability, capacity and staleness
    pub storage: Arc<dyn Storage>,
    /// Shared counters
    pub diagnostics: Arc<Diagnostics>,
    /// Published run state
    pub run_state: watch::Receiver<RunControl>,
}

/// Requests served by the monitor task
#[derive(Debug)]
pub enum HealthCommand {
    /// Probe immediately and reply with the new report
    ProbeNow(oneshot::Sender<Arc<FaultReport>>),
}

/// Cloneable access to a running monitor
#[derive(Clone)]
pub struct HealthHandle {
    commands: mpsc::Sender<HealthCommand>,
    reports: watch::Receiver<Arc<FaultReport>>,
}

impl HealthHandle {
    /// Latest published report
    pub fn latest(&self) -> Arc<FaultReport> {
        self.reports.borrow().clone()
    }

    /// Subscribe to report updates
    pub fn subscribe(&self) -> watch::Receiver<Arc<FaultReport>> {
        self.reports.clone()
    }

    /// Run a probe now and wait for its report
    pub async fn probe_now(&self) -> MonitorResult<Arc<FaultReport>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(HealthCommand::ProbeNow(tx))
            .await
            .map_err(|_| MonitorError::ShutDown)?;
        rx.await.map_err(|_| MonitorError::ShutDown)
    }
}

/// One failing condition observed by a check
struct Observation {
    code: FaultCode,
    severity: Severity,
    message: String,
}

impl Observation {
    fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.base_severity(),
            message: message.into(),
        }
    }

    fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Collects check outcomes and their observations for one probe
#[derive(Default)]
struct ProbeResults {
    checks: Vec<CheckResult>,
    evaluated: HashSet<FaultCode>,
    observed: Vec<Observation>,
}

impl ProbeResults {
    fn skip(&mut self, name: &'static str, reason: &str) {
        self.checks.push(CheckResult {
            name,
            outcome: CheckOutcome::Skipped(reason.to_string()),
        });
    }

    fn record(&mut self, name: &'static str, covers: &[FaultCode], observed: Vec<Observation>) {
        self.evaluated.extend(covers.iter().copied());
        let outcome = if observed.is_empty() {
            CheckOutcome::Ok
        } else {
            CheckOutcome::Fail(
                observed
                    .iter()
                    .map(|o| format!("{}: {}", o.code, o.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };
        self.checks.push(CheckResult { name, outcome });
        self.observed.extend(observed);
    }
}

/// Probe-driven owner of the active-fault set
pub struct HealthMonitor {
    settings: HealthSettings,
    sources: HealthSources,
    alarms: Arc<AlarmDispatcher>,
    active: HashMap<FaultCode, FaultRecord>,
    history: VecDeque<FaultRecord>,
    baseline: DiagnosticsSnapshot,
    running_since: Option<Instant>,
    halts_seen: u64,
    fault_register: Option<i16>,
    probes: u64,
    reports: watch::Sender<Arc<FaultReport>>,
    commands: Option<mpsc::Receiver<HealthCommand>>,
}

impl HealthMonitor {
    /// Monitor with no active faults, plus the handle used to reach it
    pub fn new(
        settings: HealthSettings,
        sources: HealthSources,
        alarms: Arc<AlarmDispatcher>,
    ) -> (Self, HealthHandle) {
        let (reports, report_rx) = watch::channel(Arc::new(FaultReport::empty()));
        let (command_tx, command_rx) = mpsc::channel(8);
        let baseline = sources.diagnostics.snapshot();

        let monitor = Self {
            settings,
            sources,
            alarms,
            active: HashMap::new(),
            history: VecDeque::new(),
            baseline,
            running_since: None,
            halts_seen: 0,
            fault_register: None,
            probes: 0,
            reports,
            commands: Some(command_rx),
        };
        let handle = HealthHandle {
            commands: command_tx,
            reports: report_rx,
        };
        (monitor, handle)
    }

    /// Active faults, for inspection between probes
    pub fn active_faults(&self) -> Vec<FaultRecord> {
        let mut faults: Vec<_> = self.active.values().cloned().collect();
        faults.sort_by_key(|f| f.code);
        faults
    }

    /// Run the probe loop until the run state becomes `ShutDown`
    pub async fn run(mut self) {
        let Some(mut commands) = self.commands.take() else {
            return;
        };
        let mut run_state = self.sources.run_state.clone();
        let mut interval = tokio::time::interval(self.settings.health.probe_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            period_ms = self.settings.health.probe_period_ms,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe().await;
                }
                command = commands.recv() => match command {
                    Some(HealthCommand::ProbeNow(reply)) => {
                        let report = self.probe().await;
                        let _ = reply.send(report);
                    }
                    None => break,
                },
                changed = run_state.changed() => {
                    if changed.is_err() || run_state.borrow().state == RunState::ShutDown {
                        break;
                    }
                }
            }
        }
        tracing::info!("Health monitor stopped");
    }

    /// Evaluate every enabled check once and publish the report
    pub async fn probe(&mut self) -> Arc<FaultReport> {
        let control = *self.sources.run_state.borrow();
        let state = control.state;
        if control.halts != self.halts_seen {
            self.halts_seen = control.halts;
            self.running_since = None;
        }
        match (state, self.running_since) {
            (RunState::Running, None) => self.running_since = Some(Instant::now()),
            (RunState::Running, Some(_)) => {}
            _ => self.running_since = None,
        }

        let counters = self.sources.diagnostics.snapshot();
        let mut results = ProbeResults::default();

        self.check_link(state, &mut results);
        self.check_poller(state, &mut results);
        self.check_classifier(&counters, &mut results);
        self.check_storage(&counters, &mut results).await;
        self.check_capacity(&mut results).await;
        self.check_staleness(&mut results).await;
        self.check_pipeline_events(&counters, &mut results);

        self.baseline = counters;
        self.probes += 1;
        self.reconcile(results.observed, &results.evaluated);
        self.update_fault_register().await;

        let report = Arc::new(self.build_report(results.checks));
        self.reports.send_replace(report.clone());
        tracing::debug!(
            probe = self.probes,
            status = ?report.status,
            active = report.active.len(),
            "Health probe completed"
        );
        report
    }

    fn check_link(&self, state: RunState, results: &mut ProbeResults) {
        const NAME: &str = "link";
        if !self.settings.health.checks.link {
            return results.skip(NAME, "disabled");
        }
        if state != RunState::Running {
            return results.skip(NAME, "acquisition not running");
        }

        let failures = self.sources.poller.consecutive_failures();
        let threshold = self.settings.polling.link_fault_threshold;
        let mut observed = Vec::new();
        if failures > 0 {
            let severity = if failures >= threshold {
                Severity::Critical
            } else {
                Severity::Warning
            };
            let detail = self.sources.poller.last_error().unwrap_or_default();
            observed.push(
                Observation::new(
                    FaultCode::LinkLost,
                    format!("{failures} consecutive failures: {detail}"),
                )
                .with_severity(severity),
            );
        }
        results.record(NAME, &[FaultCode::LinkLost], observed);
    }

    fn check_poller(&self, state: RunState, results: &mut ProbeResults) {
        const NAME: &str = "poller";
        if !self.settings.health.checks.poller {
            return results.skip(NAME, "disabled");
        }
        let Some(running_since) = self.running_since.filter(|_| state == RunState::Running) else {
            return results.skip(NAME, "acquisition not running");
        };

        // Backoff legitimately stretches the gap between ticks
        let failures = self.sources.poller.consecutive_failures();
        let limit = self.settings.health.liveness_timeout() + self.settings.polling.backoff_for(failures);
        let last = self
            .sources
            .poller
            .last_heartbeat()
            .map_or(running_since, |heartbeat| heartbeat.max(running_since));
        let age = last.elapsed();

        let mut observed = Vec::new();
        if age > limit {
            observed.push(Observation::new(
                FaultCode::AcquisitionStalled,
                format!("no poll tick for {} ms", age.as_millis()),
            ));
        }
        results.record(NAME, &[FaultCode::AcquisitionStalled], observed);
    }

    fn check_classifier(&self, counters: &DiagnosticsSnapshot, results: &mut ProbeResults) {
        let checks = &self.settings.health.checks;
        if checks.classifier {
            let mut observed = Vec::new();
            if !self.sources.classifier.is_loaded() {
                observed.push(Observation::new(
                    FaultCode::ClassifierUnavailable,
                    "no model loaded",
                ));
            }
            let failed = counters.classifier_failures - self.baseline.classifier_failures;
            if failed > 0 {
                observed.push(Observation::new(
                    FaultCode::ClassificationFailed,
                    format!("{failed} cycles failed classification"),
                ));
            }
            results.record(
                "classifier",
                &[FaultCode::ClassifierUnavailable, FaultCode::ClassificationFailed],
                observed,
            );
        } else {
            results.skip("classifier", "disabled");
        }

        if checks.latency {
            let limit_us = self.settings.health.max_inference_latency_ms * 1000;
            let mut observed = Vec::new();
            if counters.last_inference_latency_us > limit_us {
                observed.push(Observation::new(
                    FaultCode::InferenceLatency,
                    format!(
                        "last classification took {} ms (limit {} ms)",
                        counters.last_inference_latency_us / 1000,
                        self.settings.health.max_inference_latency_ms
                    ),
                ));
            }
            results.record("latency", &[FaultCode::InferenceLatency], observed);
        } else {
            results.skip("latency", "disabled");
        }
    }

    async fn check_storage(&self, counters: &DiagnosticsSnapshot, results: &mut ProbeResults) {
        const NAME: &str = "storage";
        if !self.settings.health.checks.storage {
            return results.skip(NAME, "disabled");
        }

        let timeout = self.settings.health.probe_timeout();
        let ping = match tokio::time::timeout(timeout, self.sources.storage.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation: "ping",
                timeout,
            }),
        };

        let mut observed = Vec::new();
        if let Err(e) = ping {
            observed.push(Observation::new(FaultCode::StorageUnavailable, e.to_string()));
        } else if counters.storage_failing {
            observed.push(Observation::new(
                FaultCode::StorageUnavailable,
                "last persist failed",
            ));
        }
        results.record(NAME, &[FaultCode::StorageUnavailable], observed);
    }

    async fn check_capacity(&self, results: &mut ProbeResults) {
        const NAME: &str = "capacity";
        let health = &self.settings.health;
        if !health.checks.capacity {
            return results.skip(NAME, "disabled");
        }

        let timeout = health.probe_timeout();
        let capacity = match tokio::time::timeout(timeout, self.sources.storage.capacity()).await {
            Ok(Ok(capacity)) => capacity,
            Ok(Err(e)) => return results.skip(NAME, &format!("capacity unavailable: {e}")),
            Err(_) => return results.skip(NAME, "capacity query timed out"),
        };

        let mut observed = Vec::new();
        if let Some(free) = capacity.free_bytes.filter(|free| *free < health.min_free_bytes) {
            observed.push(Observation::new(
                FaultCode::DiskSpaceLow,
                format!(
                    "{} MiB free (minimum {} MiB)",
                    free / (1024 * 1024),
                    health.min_free_bytes / (1024 * 1024)
                ),
            ));
        }
        if let Some(ratio) = capacity
            .usage_ratio()
            .filter(|ratio| *ratio >= health.near_capacity_ratio)
        {
            observed.push(Observation::new(
                FaultCode::StorageNearCapacity,
                format!("{:.1}% of storage limit used", ratio * 100.0),
            ));
        }
        results.record(
            NAME,
            &[FaultCode::DiskSpaceLow, FaultCode::StorageNearCapacity],
            observed,
        );
    }

    async fn check_staleness(&self, results: &mut ProbeResults) {
        const NAME: &str = "staleness";
        let health = &self.settings.health;
        let Some(stale_after) = health.stale_cycle_after_ms.map(Duration::from_millis) else {
            return results.skip(NAME, "disabled");
        };
        if !health.checks.staleness {
            return results.skip(NAME, "disabled");
        }
        // A channel can only be stale after acquisition ran for the whole window
        let Some(running_since) = self.running_since else {
            return results.skip(NAME, "acquisition not running");
        };
        if running_since.elapsed() < stale_after {
            return results.skip(NAME, "acquisition running for less than the staleness window");
        }

        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let timeout = health.probe_timeout();
        let mut stale: Vec<ChannelId> = Vec::new();

        for channel in 0..self.settings.channel_count {
            let query = self.sources.storage.recent_cycle_timestamp(channel);
            match tokio::time::timeout(timeout, query).await {
                Ok(Ok(Some(at))) if at >= cutoff => {}
                Ok(Ok(_)) => stale.push(channel),
                Ok(Err(e)) => return results.skip(NAME, &format!("storage query failed: {e}")),
                Err(_) => return results.skip(NAME, "storage query timed out"),
            }
        }

        let mut observed = Vec::new();
        if !stale.is_empty() {
            observed.push(Observation::new(
                FaultCode::CycleStale,
                format!(
                    "no completed cycle for {} min on channels {:?}",
                    stale_after.as_secs() / 60,
                    stale
                ),
            ));
        }
        results.record(NAME, &[FaultCode::CycleStale], observed);
    }

    fn check_pipeline_events(&self, counters: &DiagnosticsSnapshot, results: &mut ProbeResults) {
        let base = &self.baseline;
        let mut observed = Vec::new();

        let events = [
            (
                FaultCode::SensorDataInvalid,
                counters.implausible_cycles - base.implausible_cycles,
                "cycles discarded for implausible pressure",
            ),
            (
                FaultCode::CycleFsmFault,
                counters.fsm_violations - base.fsm_violations,
                "state machine violations",
            ),
            (
                FaultCode::CycleQueueOverflow,
                counters.queue_overflows - base.queue_overflows,
                "completed cycles dropped on queue overflow",
            ),
            (
                FaultCode::AlarmDeliveryFailed,
                counters.alarms_exhausted - base.alarms_exhausted,
                "alarms dropped after retries",
            ),
        ];
        for (code, advanced, what) in events {
            if advanced > 0 {
                observed.push(Observation::new(code, format!("{advanced} {what}")));
            }
        }
        if counters.writeback_failing {
            observed.push(Observation::new(
                FaultCode::ResultWriteBackFailed,
                "last result write-back failed",
            ));
        }

        results.record(
            "pipeline",
            &[
                FaultCode::SensorDataInvalid,
                FaultCode::CycleFsmFault,
                FaultCode::CycleQueueOverflow,
                FaultCode::AlarmDeliveryFailed,
                FaultCode::ResultWriteBackFailed,
            ],
            observed,
        );
    }

    fn reconcile(&mut self, observed: Vec<Observation>, evaluated: &HashSet<FaultCode>) {
        let now = Utc::now();
        let min_push = self.settings.health.min_push_severity;
        let mut seen = HashSet::new();

        for obs in observed {
            seen.insert(obs.code);
            let push = match self.active.get_mut(&obs.code) {
                Some(record) => {
                    record.last_seen = now;
                    record.occurrences += 1;
                    record.message = obs.message;
                    let escalated = obs.severity > record.severity;
                    record.severity = obs.severity;
                    if escalated {
                        log_fault("Fault escalated", record);
                    }
                    escalated.then(|| record.clone())
                }
                None => {
                    let record = FaultRecord::new(obs.code, obs.severity, obs.message, now);
                    log_fault("Fault raised", &record);
                    self.active.insert(obs.code, record.clone());
                    Some(record)
                }
            };

            if let Some(record) = push.filter(|r| r.code.is_alarmable() && r.severity >= min_push) {
                self.alarms.push(AlarmRequest::fault(
                    record.code,
                    record.severity,
                    format!("{}: {}", record.code.description(), record.message),
                ));
            }
        }

        let resolved: Vec<FaultCode> = self
            .active
            .keys()
            .filter(|code| evaluated.contains(code) && !seen.contains(code))
            .copied()
            .collect();
        for code in resolved {
            let Some(mut record) = self.active.remove(&code) else {
                continue;
            };
            record.resolved = true;
            record.resolved_at = Some(now);
            tracing::info!(code = %record.code, occurrences = record.occurrences, "Fault resolved");

            if self.settings.health.notify_on_resolve && code.is_alarmable() {
                self.alarms.push(AlarmRequest::fault(
                    code,
                    Severity::Info,
                    format!("Resolved: {}", code.description()),
                ));
            }

            self.history.push_back(record);
            while self.history.len() > self.settings.health.history_limit {
                self.history.pop_front();
            }
        }
    }

    async fn update_fault_register(&mut self) {
        let value = self
            .active
            .values()
            .max_by_key(|f| (f.severity, std::cmp::Reverse(f.code)))
            .map_or(0, |f| f.code.plc_value());
        if self.fault_register == Some(value) || !self.sources.link.is_connected() {
            return;
        }

        let encoding = &self.settings.fault_register;
        let write = self
            .sources
            .link
            .write_word(encoding.db_number, encoding.fault_offset, value);
        match with_timeout("write", self.settings.write_timeout, write).await {
            Ok(()) => {
                tracing::debug!(value, "Fault register updated");
                self.fault_register = Some(value);
            }
            Err(e) => tracing::warn!(value, error = %e, "Fault register write failed"),
        }
    }

    fn build_report(&self, checks: Vec<CheckResult>) -> FaultReport {
        let active = self.active_faults();
        let worst = active.iter().map(|f| f.severity).max();
        FaultReport {
            generated_at: Utc::now(),
            probe: self.probes,
            status: OverallStatus::from_worst(worst),
            checks,
            active,
            resolved: self.history.iter().cloned().collect(),
        }
    }
}

fn log_fault(what: &str, record: &FaultRecord) {
    match record.severity {
        Severity::Critical | Severity::Error => tracing::error!(
            code = %record.code,
            severity = %record.severity,
            message = %record.message,
            "{what}"
        ),
        Severity::Warning => tracing::warn!(
            code = %record.code,
            severity = %record.severity,
            message = %record.message,
            "{what}"
        ),
        Severity::Info => tracing::info!(
            code = %record.code,
            severity = %record.severity,
            message = %record.message,
            "{what}"
        ),
    }
}
