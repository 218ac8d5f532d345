//! Fault taxonomy and health report types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity level for faults and alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, e.g. a resolution notice
    Info = 0,
    /// Degraded but functional
    Warning = 1,
    /// Component malfunction, may affect results
    Error = 2,
    /// System-level failure requiring immediate attention
    Critical = 3,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Closed set of fault conditions the monitor can report about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    /// PLC link down for consecutive polls
    #[serde(rename = "F001")]
    LinkLost,
    /// No model loaded
    #[serde(rename = "F002")]
    ClassifierUnavailable,
    /// Cycle discarded for implausible pressure
    #[serde(rename = "F003")]
    SensorDataInvalid,
    /// Inference slower than the configured limit
    #[serde(rename = "F004")]
    InferenceLatency,
    /// Free space below the configured floor
    #[serde(rename = "F005")]
    DiskSpaceLow,
    /// Storage ping or persist failing
    #[serde(rename = "F006")]
    StorageUnavailable,
    /// Storage usage above the configured ratio
    #[serde(rename = "F007")]
    StorageNearCapacity,
    /// Poller heartbeat too old
    #[serde(rename = "F008")]
    AcquisitionStalled,
    /// Cycle state machine rejected a sample
    #[serde(rename = "F009")]
    CycleFsmFault,
    /// Alarm dropped after all retries
    #[serde(rename = "F010")]
    AlarmDeliveryFailed,
    /// Completed cycle dropped on a full queue
    #[serde(rename = "F011")]
    CycleQueueOverflow,
    /// Result could not be written to the PLC
    #[serde(rename = "F012")]
    ResultWriteBackFailed,
    /// No completed cycle on a channel within the window
    #[serde(rename = "F013")]
    CycleStale,
    /// Cycles failed classification
    #[serde(rename = "F014")]
    ClassificationFailed,
}

impl FaultCode {
    /// Every code, in ascending order
    pub const ALL: [FaultCode; 14] = [
        FaultCode::LinkLost,
        FaultCode::ClassifierUnavailable,
        FaultCode::SensorDataInvalid,
        FaultCode::InferenceLatency,
        FaultCode::DiskSpaceLow,
        FaultCode::StorageUnavailable,
        FaultCode::StorageNearCapacity,
        FaultCode::AcquisitionStalled,
        FaultCode::CycleFsmFault,
        FaultCode::AlarmDeliveryFailed,
        FaultCode::CycleQueueOverflow,
        FaultCode::ResultWriteBackFailed,
        FaultCode::CycleStale,
        FaultCode::ClassificationFailed,
    ];

    /// Value written to the PLC fault register
    pub fn plc_value(self) -> i16 {
        match self {
            FaultCode::LinkLost => 1,
            FaultCode::ClassifierUnavailable => 2,
            FaultCode::SensorDataInvalid => 3,
            FaultCode::InferenceLatency => 4,
            FaultCode::DiskSpaceLow => 5,
            FaultCode::StorageUnavailable => 6,
            FaultCode::StorageNearCapacity => 7,
            FaultCode::AcquisitionStalled => 8,
            FaultCode::CycleFsmFault => 9,
            FaultCode::AlarmDeliveryFailed => 10,
            FaultCode::CycleQueueOverflow => 11,
            FaultCode::ResultWriteBackFailed => 12,
            FaultCode::CycleStale => 13,
            FaultCode::ClassificationFailed => 14,
        }
    }

    /// `F001` style identifier
    pub fn as_str(self) -> &'static str {
        match self {
            FaultCode::LinkLost => "F001",
            FaultCode::ClassifierUnavailable => "F002",
            FaultCode::SensorDataInvalid => "F003",
            FaultCode::InferenceLatency => "F004",
            FaultCode::DiskSpaceLow => "F005",
            FaultCode::StorageUnavailable => "F006",
            FaultCode::StorageNearCapacity => "F007",
            FaultCode::AcquisitionStalled => "F008",
            FaultCode::CycleFsmFault => "F009",
            FaultCode::AlarmDeliveryFailed => "F010",
            FaultCode::CycleQueueOverflow => "F011",
            FaultCode::ResultWriteBackFailed => "F012",
            FaultCode::CycleStale => "F013",
            FaultCode::ClassificationFailed => "F014",
        }
    }

    /// Severity a new occurrence starts at
    pub fn base_severity(self) -> Severity {
        match self {
            FaultCode::LinkLost | FaultCode::ClassifierUnavailable => Severity::Critical,
            FaultCode::SensorDataInvalid
            | FaultCode::DiskSpaceLow
            | FaultCode::StorageUnavailable
            | FaultCode::AcquisitionStalled
            | FaultCode::CycleQueueOverflow
            | FaultCode::ClassificationFailed => Severity::Error,
            FaultCode::InferenceLatency
            | FaultCode::StorageNearCapacity
            | FaultCode::CycleFsmFault
            | FaultCode::AlarmDeliveryFailed
            | FaultCode::ResultWriteBackFailed
            | FaultCode::CycleStale => Severity::Warning,
        }
    }

    /// Operator-facing text
    pub fn description(self) -> &'static str {
        match self {
            FaultCode::LinkLost => "PLC link down",
            FaultCode::ClassifierUnavailable => "No classifier model loaded",
            FaultCode::SensorDataInvalid => "Implausible cycle data",
            FaultCode::InferenceLatency => "Classification slower than limit",
            FaultCode::DiskSpaceLow => "Free disk space below minimum",
            FaultCode::StorageUnavailable => "Storage unreachable",
            FaultCode::StorageNearCapacity => "Storage footprint near limit",
            FaultCode::AcquisitionStalled => "Poller heartbeat stale",
            FaultCode::CycleFsmFault => "Cycle state machine violation",
            FaultCode::AlarmDeliveryFailed => "Alarm dropped after retries",
            FaultCode::CycleQueueOverflow => "Completed cycle dropped on queue overflow",
            FaultCode::ResultWriteBackFailed => "PLC result write-back failing",
            FaultCode::CycleStale => "No recent completed cycle",
            FaultCode::ClassificationFailed => "Classifier error on a cycle",
        }
    }

    /// Event faults reproduce when their counter advanced since the last probe
    pub fn is_event(self) -> bool {
        matches!(
            self,
            FaultCode::SensorDataInvalid
                | FaultCode::CycleFsmFault
                | FaultCode::AlarmDeliveryFailed
                | FaultCode::CycleQueueOverflow
                | FaultCode::ClassificationFailed
        )
    }

    /// Whether a raise of this fault may itself be pushed as an alarm
    pub fn is_alarmable(self) -> bool {
        self != FaultCode::AlarmDeliveryFailed
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed fault condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Condition
    pub code: FaultCode,
    /// Current severity, raised by escalation
    pub severity: Severity,
    /// Detail from the latest occurrence
    pub message: String,
    /// First probe that observed it
    pub first_seen: DateTime<Utc>,
    /// Latest probe that observed it
    pub last_seen: DateTime<Utc>,
    /// Set once a probe no longer observes it
    pub resolved: bool,
    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,
    /// Probes on which the condition was observed
    pub occurrences: u64,
}

impl FaultRecord {
    /// Record a first occurrence
    pub fn new(code: FaultCode, severity: Severity, message: String, at: DateTime<Utc>) -> Self {
        Self {
            code,
            severity,
            message,
            first_seen: at,
            last_seen: at,
            resolved: false,
            resolved_at: None,
            occurrences: 1,
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// Evaluated, nothing observed
    Ok,
    /// Evaluated, at least one fault observed
    Fail(String),
    /// Not evaluated, with the reason
    Skipped(String),
}

/// Named check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    /// Check name
    pub name: &'static str,
    /// What the check concluded
    pub outcome: CheckOutcome,
}

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// No active faults
    Healthy,
    /// Active faults below critical
    Degraded,
    /// At least one critical fault
    Critical,
}

/// Point-in-time health snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultReport {
    /// When the probe finished
    pub generated_at: DateTime<Utc>,
    /// Probe counter, 0 before the first probe
    pub probe: u64,
    /// Derived from the worst active severity
    pub status: OverallStatus,
    /// One entry per check, in evaluation order
    pub checks: Vec<CheckResult>,
    /// Active faults sorted by code
    pub active: Vec<FaultRecord>,
    /// Recently resolved faults, oldest first
    pub resolved: Vec<FaultRecord>,
}

impl FaultReport {
    /// Report before any probe has run
    pub fn empty() -> Self {
        Self {
            generated_at: Utc::now(),
            probe: 0,
            status: OverallStatus::Healthy,
            checks: Vec::new(),
            active: Vec::new(),
            resolved: Vec::new(),
        }
    }

    /// True when `code` is among the active faults
    pub fn is_active(&self, code: FaultCode) -> bool {
        self.active.iter().any(|f| f.code == code)
    }

    /// Active record for `code`
    pub fn active_fault(&self, code: FaultCode) -> Option<&FaultRecord> {
        self.active.iter().find(|f| f.code == code)
    }

    /// Highest active severity
    pub fn worst_severity(&self) -> Option<Severity> {
        self.active.iter().map(|f| f.severity).max()
    }
}

impl OverallStatus {
    /// Status for the worst active severity
    pub fn from_worst(worst: Option<Severity>) -> Self {
        match worst {
            None => OverallStatus::Healthy,
            Some(Severity::Critical) => OverallStatus::Critical,
            Some(_) => OverallStatus::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique_and_ordered() {
        for (index, code) in FaultCode::ALL.iter().enumerate() {
            assert_eq!(code.plc_value() as usize, index + 1);
            assert_eq!(code.as_str(), format!("F{:03}", index + 1));
        }
    }

    #[test]
    fn test_serialises_as_code_string() {
        let json = serde_json::to_string(&FaultCode::CycleQueueOverflow).unwrap();
        assert_eq!(json, "\"F011\"");
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(OverallStatus::from_worst(Some(Severity::Warning)), OverallStatus::Degraded);
        assert_eq!(OverallStatus::from_worst(None), OverallStatus::Healthy);
    }

    #[test]
    fn test_alarm_delivery_fault_is_never_alarmed() {
        assert!(!FaultCode::AlarmDeliveryFailed.is_alarmable());
        assert!(FaultCode::AlarmDeliveryFailed.is_event());
        assert!(!FaultCode::LinkLost.is_event());
    }
}
