//! Shared operational counters.
//!
//! Components on the sampling path, the pipeline workers and the alarm workers only
//! ever increment these counters or flip the failing flags; the health monitor reads
//! them on each probe and turns advances into fault records. All fields are atomics so
//! no component ever waits on another to record an occurrence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters and flags shared by every component.
#[derive(Debug, Default)]
pub struct Diagnostics {
    polls: AtomicU64,
    link_failures: AtomicU64,
    reconnects: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_aborted: AtomicU64,
    cycles_forced: AtomicU64,
    cycles_discarded: AtomicU64,
    fsm_violations: AtomicU64,
    implausible_cycles: AtomicU64,
    queue_overflows: AtomicU64,
    classifier_failures: AtomicU64,
    storage_failures: AtomicU64,
    writeback_failures: AtomicU64,
    alarms_delivered: AtomicU64,
    alarms_exhausted: AtomicU64,
    alarms_rejected: AtomicU64,
    last_inference_latency_us: AtomicU64,
    storage_failing: AtomicBool,
    writeback_failing: AtomicBool,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Successful block reads
    pub polls: u64,
    /// Failed connects and reads
    pub link_failures: u64,
    /// Sessions reopened after a failure
    pub reconnects: u64,
    /// Windows handed to the queue, forced ones included
    pub cycles_completed: u64,
    /// Windows below the minimums
    pub cycles_aborted: u64,
    /// Windows ended by a duration or sample limit
    pub cycles_forced: u64,
    /// In-flight windows dropped by a reset
    pub cycles_discarded: u64,
    /// Samples the state machine refused
    pub fsm_violations: u64,
    /// Windows with out-of-range pressure
    pub implausible_cycles: u64,
    /// Windows lost to a full queue
    pub queue_overflows: u64,
    /// Cycles whose classification failed
    pub classifier_failures: u64,
    /// Failed persist calls
    pub storage_failures: u64,
    /// Failed result write-backs
    pub writeback_failures: u64,
    /// Alarm deliveries acknowledged by a target
    pub alarms_delivered: u64,
    /// Alarm deliveries dropped after retries
    pub alarms_exhausted: u64,
    /// Alarms refused by a full or closed target queue
    pub alarms_rejected: u64,
    /// Latency of the most recent classification
    pub last_inference_latency_us: u64,
    /// Last persist failed
    pub storage_failing: bool,
    /// Last write-back failed
    pub writeback_failing: bool,
}

impl Diagnostics {
    /// Create a zeroed set of counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A block read succeeded.
    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// A connect or read failed.
    pub fn record_link_failure(&self) {
        self.link_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A session was reopened after a failure.
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// A window was emitted; `forced` when a limit ended it.
    pub fn record_cycle_completed(&self, forced: bool) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.cycles_forced.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Spurious trigger: minimums not met.
    pub fn record_cycle_aborted(&self) {
        self.cycles_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// In-flight buffer discarded by a reset command.
    pub fn record_cycle_discarded(&self) {
        self.cycles_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A sample was refused by the state machine.
    pub fn record_fsm_violation(&self) {
        self.fsm_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// A window was dropped for out-of-range pressure.
    pub fn record_implausible_cycle(&self) {
        self.implausible_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// A window was lost to a full queue.
    pub fn record_queue_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// A cycle failed classification.
    pub fn record_classifier_failure(&self) {
        self.classifier_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one persist call.
    pub fn record_storage_outcome(&self, ok: bool) {
        if !ok {
            self.storage_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.storage_failing.store(!ok, Ordering::Relaxed);
    }

    /// Record the outcome of one result write-back.
    pub fn record_writeback_outcome(&self, ok: bool) {
        if !ok {
            self.writeback_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.writeback_failing.store(!ok, Ordering::Relaxed);
    }

    /// A target acknowledged an alarm.
    pub fn record_alarm_delivered(&self) {
        self.alarms_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// An alarm was dropped after exhausting its retries on one target.
    pub fn record_alarm_exhausted(&self) {
        self.alarms_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// An alarm was refused because a target queue was full or closed.
    pub fn record_alarm_rejected(&self) {
        self.alarms_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency of the latest classification.
    pub fn record_inference_latency(&self, latency: std::time::Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.last_inference_latency_us
            .store(micros, Ordering::Relaxed);
    }

    /// Copy all counters
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_aborted: self.cycles_aborted.load(Ordering::Relaxed),
            cycles_forced: self.cycles_forced.load(Ordering::Relaxed),
            cycles_discarded: self.cycles_discarded.load(Ordering::Relaxed),
            fsm_violations: self.fsm_violations.load(Ordering::Relaxed),
            implausible_cycles: self.implausible_cycles.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            classifier_failures: self.classifier_failures.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            writeback_failures: self.writeback_failures.load(Ordering::Relaxed),
            alarms_delivered: self.alarms_delivered.load(Ordering::Relaxed),
            alarms_exhausted: self.alarms_exhausted.load(Ordering::Relaxed),
            alarms_rejected: self.alarms_rejected.load(Ordering::Relaxed),
            last_inference_latency_us: self.last_inference_latency_us.load(Ordering::Relaxed),
            storage_failing: self.storage_failing.load(Ordering::Relaxed),
            writeback_failing: self.writeback_failing.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn storage_flag_follows_last_outcome() {
        let diag = Diagnostics::new();
        diag.record_storage_outcome(false);
        diag.record_storage_outcome(false);
        assert!(diag.snapshot().storage_failing);
        assert_eq!(diag.snapshot().storage_failures, 2);

        diag.record_storage_outcome(true);
        let snap = diag.snapshot();
        assert!(!snap.storage_failing);
        assert_eq!(snap.storage_failures, 2);
    }

    #[test]
    fn forced_cycles_count_as_completed() {
        let diag = Diagnostics::new();
        diag.record_cycle_completed(true);
        diag.record_cycle_completed(false);
        let snap = diag.snapshot();
        assert_eq!(snap.cycles_completed, 2);
        assert_eq!(snap.cycles_forced, 1);
    }

    #[test]
    fn latency_is_stored_in_micros() {
        let diag = Diagnostics::new();
        diag.record_inference_latency(Duration::from_millis(12));
        assert_eq!(diag.snapshot().last_inference_latency_us, 12_000);
    }
}
