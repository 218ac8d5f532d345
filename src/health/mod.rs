//! Self-health monitoring
//!
//! - [`fault`]: the closed fault taxonomy and the report snapshot types
//! - [`monitor`]: the probe task that owns the active-fault set

pub mod fault;
pub mod monitor;

pub use fault::{
    CheckOutcome, CheckResult, FaultCode, FaultRecord, FaultReport, OverallStatus, Severity,
};
pub use monitor::{HealthCommand, HealthHandle, HealthMonitor, HealthSettings, HealthSources};
