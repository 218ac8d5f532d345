//! Health monitor probes and alarm dispatch with scripted collaborators.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{completed_window, layout, wait_until, RecordingTarget, ScriptedClassifier, ScriptedLink};
use leak_daq::acquisition::{CycleQueue, OverflowPolicy, Poller, PollerSettings, PollerStatus};
use leak_daq::alarm::{AlarmDispatcher, AlarmRequest, AlarmTarget, DeliveryPolicy, DispatcherSettings};
use leak_daq::config::{CycleConfig, HealthConfig, LinkConfig, PollingConfig};
use leak_daq::controller::{RunControl, RunState};
use leak_daq::diagnostics::Diagnostics;
use leak_daq::health::{
    FaultCode, HealthMonitor, HealthSettings, HealthSources, OverallStatus, Severity,
};
use chrono::Utc;
use leak_daq::link::layout::ResultEncoding;
use leak_daq::storage::memory::MemoryStorage;
use leak_daq::storage::{CycleRecord, Storage};
use tokio::sync::watch;
use tracing_test::traced_test;

fn dispatcher_settings(grace: Duration) -> DispatcherSettings {
    DispatcherSettings {
        source: "test".to_string(),
        queue_capacity: 16,
        workers_per_target: 1,
        shutdown_grace: grace,
    }
}

fn policy(max_attempts: u32) -> DeliveryPolicy {
    DeliveryPolicy {
        timeout: Duration::from_millis(500),
        max_attempts,
        backoff: Duration::from_millis(20),
    }
}

struct Harness {
    link: Arc<ScriptedLink>,
    poller: Poller,
    monitor: HealthMonitor,
    storage: Arc<MemoryStorage>,
    target: Arc<RecordingTarget>,
    diagnostics: Arc<Diagnostics>,
    state: watch::Sender<RunControl>,
}

impl Harness {
    fn command(&self, to: RunState) {
        self.state.send_modify(|control| *control = control.advance(to));
    }

    /// One idle frame, `active` frames inside a cycle, then the falling edge
    fn script_cycle(&self, active: usize) {
        self.link.push_frames(1, false, 950.0);
        self.link.push_frames(active, true, 650.0);
        self.link.push_frames(1, false, 950.0);
    }
}

fn harness(configure: impl FnOnce(&mut HealthConfig)) -> Harness {
    let mut health = HealthConfig {
        stale_cycle_after_ms: None,
        min_free_bytes: 0,
        ..Default::default()
    };
    configure(&mut health);
    let polling = PollingConfig::default();

    let link = Arc::new(ScriptedLink::new(layout(1)));
    let diagnostics = Arc::new(Diagnostics::new());
    let status = Arc::new(PollerStatus::new());
    let storage = Arc::new(MemoryStorage::default());
    let (state, state_rx) = watch::channel(RunControl::new(RunState::Running));

    let poller = Poller::new(
        link.clone(),
        PollerSettings {
            link: LinkConfig {
                layout: layout(1),
                ..Default::default()
            },
            polling: polling.clone(),
            cycle: CycleConfig::default(),
        },
        Arc::new(CycleQueue::new(4, OverflowPolicy::DropOldest)),
        diagnostics.clone(),
        status.clone(),
    );

    let target = Arc::new(RecordingTarget::new("scada"));
    let alarm_target: Arc<dyn AlarmTarget> = target.clone();
    let alarms = Arc::new(AlarmDispatcher::new(
        dispatcher_settings(Duration::from_millis(100)),
        vec![(alarm_target, policy(1))],
        diagnostics.clone(),
    ));

    let (monitor, _handle) = HealthMonitor::new(
        HealthSettings {
            health,
            polling,
            fault_register: ResultEncoding::default(),
            write_timeout: Duration::from_millis(100),
            channel_count: 1,
        },
        HealthSources {
            link: link.clone(),
            poller: status,
            classifier: Arc::new(ScriptedClassifier::new(0.9)),
            storage: storage.clone(),
            diagnostics: diagnostics.clone(),
            run_state: state_rx,
        },
        alarms,
    );

    Harness {
        link,
        poller,
        monitor,
        storage,
        target,
        diagnostics,
        state,
    }
}

async fn fault_alarms(target: &RecordingTarget, code: &str) -> usize {
    tokio::time::sleep(Duration::from_millis(50)).await;
    target
        .delivered()
        .iter()
        .filter(|p| p["fault_code"] == code)
        .count()
}

#[tokio::test]
#[traced_test]
async fn test_three_link_errors_raise_and_resolve_one_fault() {
    let mut h = harness(|_| {});

    h.poller.tick().await;
    let report = h.monitor.probe().await;
    assert_eq!(report.status, OverallStatus::Healthy);

    h.link.push_failures(3);
    for _ in 0..3 {
        h.poller.tick().await;
    }
    let report = h.monitor.probe().await;
    let fault = report.active_fault(FaultCode::LinkLost).unwrap();
    assert_eq!(fault.severity, Severity::Critical);
    assert_eq!(report.status, OverallStatus::Critical);

    h.poller.tick().await;
    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::LinkLost));
    assert_eq!(report.status, OverallStatus::Healthy);

    // A further healthy probe changes nothing
    let report = h.monitor.probe().await;
    let resolved: Vec<_> = report
        .resolved
        .iter()
        .filter(|f| f.code == FaultCode::LinkLost)
        .collect();
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].resolved);
    assert!(resolved[0].resolved_at.is_some());

    assert_eq!(fault_alarms(&h.target, "F001").await, 1);
    assert!(logs_contain("Fault raised"));
    assert!(logs_contain("Fault resolved"));
}

#[tokio::test]
async fn test_escalation_pushes_alarm_once_threshold_is_reached() {
    let mut h = harness(|_| {});
    h.poller.tick().await;

    h.link.push_failures(3);
    h.poller.tick().await;
    let report = h.monitor.probe().await;
    assert_eq!(
        report.active_fault(FaultCode::LinkLost).unwrap().severity,
        Severity::Warning
    );
    assert_eq!(fault_alarms(&h.target, "F001").await, 0);

    h.poller.tick().await;
    h.poller.tick().await;
    let report = h.monitor.probe().await;
    let fault = report.active_fault(FaultCode::LinkLost).unwrap();
    assert_eq!(fault.severity, Severity::Critical);
    assert_eq!(fault.occurrences, 2);
    assert_eq!(fault_alarms(&h.target, "F001").await, 1);
}

#[tokio::test]
async fn test_event_fault_tracks_counter_advance_and_is_never_alarmed() {
    let mut h = harness(|health| health.min_push_severity = Severity::Info);
    h.poller.tick().await;

    h.diagnostics.record_alarm_exhausted();
    let report = h.monitor.probe().await;
    assert!(report.is_active(FaultCode::AlarmDeliveryFailed));

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::AlarmDeliveryFailed));
    assert_eq!(fault_alarms(&h.target, "F010").await, 0);
}

#[tokio::test]
async fn test_fault_register_follows_worst_active_fault() {
    let mut h = harness(|_| {});
    h.poller.tick().await;
    let encoding = ResultEncoding::default();

    h.monitor.probe().await;
    h.storage.set_available(false);
    h.monitor.probe().await;
    h.storage.set_available(true);
    h.monitor.probe().await;
    h.monitor.probe().await;

    let register: Vec<i16> = h
        .link
        .writes()
        .into_iter()
        .filter(|(db, offset, _)| *db == encoding.db_number && *offset == encoding.fault_offset)
        .map(|(_, _, value)| value)
        .collect();
    assert_eq!(register, vec![0, FaultCode::StorageUnavailable.plc_value(), 0]);
}

#[tokio::test]
async fn test_paused_monitor_skips_link_and_poller_checks() {
    let mut h = harness(|_| {});
    h.command(RunState::Paused);
    h.link.push_failures(5);

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::LinkLost));
    assert!(!report.is_active(FaultCode::AcquisitionStalled));
    let link_check = report.checks.iter().find(|c| c.name == "link").unwrap();
    assert!(matches!(
        link_check.outcome,
        leak_daq::health::CheckOutcome::Skipped(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_silent_channel_goes_stale_and_recovers_on_persist() {
    let mut h = harness(|health| health.stale_cycle_after_ms = Some(60_000));

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::CycleStale));
    let staleness = report.checks.iter().find(|c| c.name == "staleness").unwrap();
    assert!(matches!(
        staleness.outcome,
        leak_daq::health::CheckOutcome::Skipped(_)
    ));

    tokio::time::sleep(Duration::from_secs(61)).await;
    let report = h.monitor.probe().await;
    let fault = report.active_fault(FaultCode::CycleStale).unwrap();
    assert!(fault.message.contains("[0]"));

    let window = completed_window(0, &[700.0, 650.0, 640.0]).unwrap();
    let mut record = CycleRecord::new(&window, None, Err("no model".to_string()));
    record.ended_at = Utc::now();
    h.storage.persist(&record).await.unwrap();

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::CycleStale));
    assert!(report
        .resolved
        .iter()
        .any(|f| f.code == FaultCode::CycleStale && f.resolved));
}

#[tokio::test(start_paused = true)]
async fn test_pause_then_resume_restarts_staleness_window() {
    let mut h = harness(|health| health.stale_cycle_after_ms = Some(60_000));
    h.monitor.probe().await;
    tokio::time::sleep(Duration::from_secs(61)).await;

    // Both commands land before the monitor looks at the run state again
    h.command(RunState::Paused);
    h.command(RunState::Running);

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::CycleStale));
    let staleness = report.checks.iter().find(|c| c.name == "staleness").unwrap();
    assert!(matches!(
        staleness.outcome,
        leak_daq::health::CheckOutcome::Skipped(_)
    ));
}

#[tokio::test]
async fn test_drop_oldest_overflow_raises_event_fault_once() {
    let mut h = harness(|_| {});
    // Capacity is four and nothing drains the queue
    for _ in 0..5 {
        h.script_cycle(120);
    }
    while h.link.remaining() > 0 {
        h.poller.tick().await;
    }
    let snap = h.diagnostics.snapshot();
    assert_eq!(snap.cycles_completed, 5);
    assert_eq!(snap.queue_overflows, 1);

    let report = h.monitor.probe().await;
    let fault = report.active_fault(FaultCode::CycleQueueOverflow).unwrap();
    assert!(fault.message.starts_with("1 "));

    let report = h.monitor.probe().await;
    assert!(!report.is_active(FaultCode::CycleQueueOverflow));
}

#[tokio::test]
async fn test_push_returns_before_delivery_and_exhausts_once() {
    let diagnostics = Arc::new(Diagnostics::new());
    let target = Arc::new(RecordingTarget::failing("down"));
    let alarm_target: Arc<dyn AlarmTarget> = target.clone();
    let dispatcher = AlarmDispatcher::new(
        dispatcher_settings(Duration::from_millis(100)),
        vec![(alarm_target, policy(3))],
        diagnostics.clone(),
    );

    let started = Instant::now();
    let accepted = dispatcher.push(AlarmRequest::fault(
        FaultCode::DiskSpaceLow,
        Severity::Error,
        "disk nearly full",
    ));
    assert!(started.elapsed() < Duration::from_millis(20));
    assert_eq!(accepted, 1);

    let diag = diagnostics.clone();
    assert!(wait_until(Duration::from_secs(2), || diag.snapshot().alarms_exhausted == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(target.attempts(), 3);
    let snap = diagnostics.snapshot();
    assert_eq!(snap.alarms_exhausted, 1);
    assert_eq!(snap.alarms_delivered, 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_slow_target_does_not_delay_other_targets() {
    let diagnostics = Arc::new(Diagnostics::new());
    let slow = Arc::new(RecordingTarget::slow("slow", Duration::from_secs(3)));
    let fast = Arc::new(RecordingTarget::new("fast"));
    let slow_target: Arc<dyn AlarmTarget> = slow.clone();
    let fast_target: Arc<dyn AlarmTarget> = fast.clone();
    let mut slow_policy = policy(1);
    slow_policy.timeout = Duration::from_secs(10);

    let dispatcher = AlarmDispatcher::new(
        dispatcher_settings(Duration::from_millis(100)),
        vec![(slow_target, slow_policy), (fast_target, policy(1))],
        diagnostics,
    );

    for channel in 0..2 {
        assert_eq!(dispatcher.push(AlarmRequest::leak(channel, 1, 0.05)), 2);
    }

    let delivered = fast.clone();
    assert!(wait_until(Duration::from_millis(500), || delivered.delivered().len() == 2).await);
    assert!(slow.delivered().is_empty());

    // Shutdown abandons the stuck delivery after the grace period
    let started = Instant::now();
    dispatcher.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(dispatcher.push(AlarmRequest::leak(0, 2, 0.05)), 0);
}
