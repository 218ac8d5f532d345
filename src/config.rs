//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. Built-in defaults (a runnable mock setup)
//! 2. A TOML file (`config/leak_daq.toml` by default)
//! 3. Environment variables prefixed with `LEAK_DAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use leak_daq::config::MonitorConfig;
//!
//! let config = MonitorConfig::load()?;
//! config.validate()?;
//! println!("Channels: {}", config.link.layout.channel_count);
//! # Ok::<(), leak_daq::error::MonitorError>(())
//! ```
//!
//! Example override: `LEAK_DAQ_POLLING__PERIOD_MS=20`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::cycle_fsm::TriggerSource;
use crate::acquisition::queue::OverflowPolicy;
use crate::error::{MonitorError, MonitorResult};
use crate::health::fault::Severity;
use crate::link::layout::{BlockLayout, ResultEncoding};
use crate::logging::OutputFormat;
use crate::pipeline::features::FeatureMode;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/leak_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// PLC link settings
    pub link: LinkConfig,
    /// Poller cadence and reconnect policy
    pub polling: PollingConfig,
    /// Cycle detection policy
    pub cycle: CycleConfig,
    /// Classification pipeline
    pub pipeline: PipelineConfig,
    /// Health monitor
    pub health: HealthConfig,
    /// Alarm dispatcher
    pub alarm: AlarmConfig,
    /// Record storage
    pub storage: StorageConfig,
    /// Classifier model
    pub model: ModelConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "leak-daq".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Which link driver to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Synthetic cavities
    #[default]
    Mock,
    /// No driver; acquisition keeps retrying and reports the link down
    None,
}

/// PLC link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link driver
    pub mode: LinkMode,
    /// Timeout for connecting
    pub connect_timeout_ms: u64,
    /// Timeout for one block read
    pub read_timeout_ms: u64,
    /// Timeout for one register write
    pub write_timeout_ms: u64,
    /// Layout of the polled data block
    pub layout: BlockLayout,
    /// Encoding of results and fault codes written back to the PLC
    pub write_back: ResultEncoding,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Mock,
            connect_timeout_ms: 2000,
            read_timeout_ms: 500,
            write_timeout_ms: 500,
            layout: BlockLayout::default(),
            write_back: ResultEncoding::default(),
        }
    }
}

impl LinkConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout as a `Duration`
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Sampling period
    pub period_ms: u64,
    /// First backoff delay after a link failure
    pub backoff_initial_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Consecutive failures before the link is marked faulted
    pub link_fault_threshold: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period_ms: 10,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            link_fault_threshold: 3,
        }
    }
}

impl PollingConfig {
    /// Sampling period as a `Duration`
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Backoff before the attempt following `consecutive_failures` failures.
    ///
    /// Doubles from `backoff_initial_ms` and saturates at `backoff_max_ms`.
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.period();
        }
        let exponent = (consecutive_failures - 1).min(31);
        let delay = self
            .backoff_initial_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// Cycle detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Where the test-active signal comes from
    pub trigger: TriggerSource,
    /// Minimum samples for a cycle to be emitted
    pub min_samples: usize,
    /// Minimum cycle duration
    pub min_duration_ms: u64,
    /// Forced termination after this duration
    pub max_duration_ms: u64,
    /// Channel buffer capacity; reaching it forces termination
    pub max_samples: usize,
    /// Plausible pressure range, inclusive
    pub pressure_range: [f64; 2],
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerSource::StatusBit,
            min_samples: 100,
            min_duration_ms: 1000,
            max_duration_ms: 45_000,
            max_samples: 3000,
            pressure_range: [0.0, 2000.0],
        }
    }
}

impl CycleConfig {
    /// Minimum duration as a `Duration`
    pub fn min_duration(&self) -> Duration {
        Duration::from_millis(self.min_duration_ms)
    }

    /// Maximum duration as a `Duration`
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Pipeline orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Completed-cycle queue capacity
    pub queue_capacity: usize,
    /// What to drop when the queue is full
    pub overflow_policy: OverflowPolicy,
    /// Number of pipeline workers
    pub workers: usize,
    /// Classification timeout
    pub classify_timeout_ms: u64,
    /// Result write-back timeout
    pub write_timeout_ms: u64,
    /// Storage persist timeout
    pub persist_timeout_ms: u64,
    /// Submit an alarm for every positive leak detection
    pub alarm_on_leak: bool,
    /// Probability of no-leak at or above which a cycle is classified OK
    pub threshold: f64,
    /// Feature vector layout expected by the model
    pub feature_mode: FeatureMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            overflow_policy: OverflowPolicy::DropOldest,
            workers: 1,
            classify_timeout_ms: 2000,
            write_timeout_ms: 500,
            persist_timeout_ms: 2000,
            alarm_on_leak: false,
            threshold: 0.3,
            feature_mode: FeatureMode::SevenD,
        }
    }
}

impl PipelineConfig {
    /// Classification timeout as a `Duration`
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    /// Write-back timeout as a `Duration`
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Persist timeout as a `Duration`
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

/// Per-check enable flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthChecks {
    /// Consecutive link failures
    pub link: bool,
    /// Poller heartbeat age
    pub poller: bool,
    /// Model loaded and classification failures
    pub classifier: bool,
    /// Storage ping and persist failures
    pub storage: bool,
    /// Channels without a recent cycle
    pub staleness: bool,
    /// Disk space and storage usage
    pub capacity: bool,
    /// Inference latency
    pub latency: bool,
}

impl Default for HealthChecks {
    fn default() -> Self {
        Self {
            link: true,
            poller: true,
            classifier: true,
            storage: true,
            staleness: true,
            capacity: true,
            latency: true,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe period, independent of the sampling period
    pub probe_period_ms: u64,
    /// Poller heartbeat age above which acquisition counts as stalled
    pub liveness_timeout_ms: u64,
    /// A channel with no completed cycle for this long is stale (None disables)
    pub stale_cycle_after_ms: Option<u64>,
    /// Minimum free bytes on the storage volume
    pub min_free_bytes: u64,
    /// Fraction of the storage limit that counts as near capacity
    pub near_capacity_ratio: f64,
    /// Classification latency limit
    pub max_inference_latency_ms: u64,
    /// Timeout for each storage probe
    pub probe_timeout_ms: u64,
    /// Faults at or above this severity are pushed as alarms
    pub min_push_severity: Severity,
    /// Push an informational alarm when a fault resolves
    pub notify_on_resolve: bool,
    /// Number of resolved faults kept in the report
    pub history_limit: usize,
    /// Enabled checks
    pub checks: HealthChecks,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_period_ms: 60_000,
            liveness_timeout_ms: 5000,
            stale_cycle_after_ms: Some(30 * 60 * 1000),
            min_free_bytes: 100 * 1024 * 1024,
            near_capacity_ratio: 0.9,
            max_inference_latency_ms: 500,
            probe_timeout_ms: 2000,
            min_push_severity: Severity::Error,
            notify_on_resolve: false,
            history_limit: 200,
            checks: HealthChecks::default(),
        }
    }
}

impl HealthConfig {
    /// Probe period as a `Duration`
    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_period_ms)
    }

    /// Liveness timeout as a `Duration`
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Probe timeout as a `Duration`
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// One HTTP(S) alarm endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmTargetConfig {
    /// Unique target name, used in logs and diagnostics
    pub name: String,
    /// Endpoint URL accepting a JSON POST
    pub url: String,
    /// Per-request timeout
    #[serde(default = "default_target_timeout")]
    pub timeout_ms: u64,
    /// Total attempts per alarm, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts; doubles after each failure
    #[serde(default = "default_target_backoff")]
    pub backoff_ms: u64,
}

fn default_target_timeout() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_target_backoff() -> u64 {
    1000
}

impl AlarmTargetConfig {
    /// Request timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Alarm dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Master switch
    pub enabled: bool,
    /// `source` field of every payload
    pub source: String,
    /// Per-target queue capacity
    pub queue_capacity: usize,
    /// Delivery workers per target
    pub workers_per_target: usize,
    /// How long shutdown waits for in-flight deliveries before abandoning them
    pub shutdown_grace_ms: u64,
    /// Delivery targets
    pub targets: Vec<AlarmTargetConfig>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: "leak_daq".to_string(),
            queue_capacity: 128,
            workers_per_target: 2,
            shutdown_grace_ms: 2000,
            targets: Vec::new(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process store, lost on exit
    Memory,
    /// Daily JSON-lines files under `output_dir`
    Jsonl,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend
    pub backend: StorageBackend,
    /// Output directory for record files
    pub output_dir: PathBuf,
    /// Storage footprint limit used by the near-capacity check
    pub capacity_limit_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            output_dir: PathBuf::from("data"),
            capacity_limit_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Classifier model configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// JSON model artifact; without it the classifier reports not-loaded
    pub path: Option<PathBuf>,
}

impl MonitorConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> MonitorResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> MonitorResult<Self> {
        let config = Figment::from(Serialized::defaults(MonitorConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LEAK_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string on top of the defaults
    pub fn from_toml_str(toml: &str) -> MonitorResult<Self> {
        let config = Figment::from(Serialized::defaults(MonitorConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> MonitorResult<()> {
        let invalid = |msg: String| Err(MonitorError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Err(msg) = self.link.layout.check() {
            return invalid(msg);
        }

        if self.polling.period_ms == 0 {
            return invalid("polling.period_ms must be greater than 0".to_string());
        }
        if self.polling.backoff_initial_ms > self.polling.backoff_max_ms {
            return invalid(format!(
                "polling.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.polling.backoff_initial_ms, self.polling.backoff_max_ms
            ));
        }
        if self.polling.link_fault_threshold == 0 {
            return invalid("polling.link_fault_threshold must be at least 1".to_string());
        }

        let cycle = &self.cycle;
        if cycle.min_samples == 0 {
            return invalid("cycle.min_samples must be at least 1".to_string());
        }
        // The arming sample alone must not fill the buffer
        if cycle.max_samples < 2 {
            return invalid(format!(
                "cycle.max_samples must be at least 2, got {}",
                cycle.max_samples
            ));
        }
        if cycle.min_samples > cycle.max_samples {
            return invalid(format!(
                "cycle.min_samples ({}) exceeds max_samples ({})",
                cycle.min_samples, cycle.max_samples
            ));
        }
        if cycle.min_duration_ms > cycle.max_duration_ms {
            return invalid(format!(
                "cycle.min_duration_ms ({}) exceeds max_duration_ms ({})",
                cycle.min_duration_ms, cycle.max_duration_ms
            ));
        }
        if cycle.trigger == TriggerSource::StatusBit && self.link.layout.status_offset.is_none() {
            return invalid(
                "cycle.trigger = status_bit needs link.layout.status_offset".to_string(),
            );
        }
        if let TriggerSource::PressureDrop {
            start_drop,
            end_rise,
        } = cycle.trigger
        {
            if start_drop <= 0.0 || end_rise <= 0.0 {
                return invalid("pressure_drop trigger thresholds must be positive".to_string());
            }
        }
        if cycle.pressure_range[0] > cycle.pressure_range[1] {
            return invalid("cycle.pressure_range lower bound exceeds upper bound".to_string());
        }

        if self.pipeline.queue_capacity == 0 {
            return invalid("pipeline.queue_capacity must be at least 1".to_string());
        }
        if self.pipeline.workers == 0 {
            return invalid("pipeline.workers must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.pipeline.threshold) {
            return invalid(format!(
                "pipeline.threshold {} must be within 0.0..=1.0",
                self.pipeline.threshold
            ));
        }

        if self.health.probe_period_ms == 0 {
            return invalid("health.probe_period_ms must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.health.near_capacity_ratio) {
            return invalid("health.near_capacity_ratio must be within 0.0..=1.0".to_string());
        }

        if self.alarm.queue_capacity == 0 || self.alarm.workers_per_target == 0 {
            return invalid(
                "alarm.queue_capacity and alarm.workers_per_target must be at least 1"
                    .to_string(),
            );
        }
        let mut names = HashSet::new();
        for target in &self.alarm.targets {
            if !names.insert(&target.name) {
                return invalid(format!("Duplicate alarm target name: {}", target.name));
            }
            if target.max_attempts == 0 {
                return invalid(format!(
                    "Alarm target '{}' must allow at least one attempt",
                    target.name
                ));
            }
            if !(target.url.starts_with("http://") || target.url.starts_with("https://")) {
                return invalid(format!(
                    "Alarm target '{}' has non-HTTP url '{}'",
                    target.name, target.url
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.link.layout.channel_count, 25);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [polling]
            period_ms = 20

            [cycle]
            min_samples = 5
            trigger = { kind = "pressure_drop", start_drop = 40.0, end_rise = 30.0 }

            [[alarm.targets]]
            name = "scada"
            url = "http://10.0.0.5/alarm"
            "#,
        )
        .unwrap();

        assert_eq!(config.polling.period_ms, 20);
        assert_eq!(config.polling.link_fault_threshold, 3);
        assert_eq!(config.cycle.min_samples, 5);
        assert!(matches!(
            config.cycle.trigger,
            TriggerSource::PressureDrop { start_drop, .. } if start_drop == 40.0
        ));
        assert_eq!(config.alarm.targets[0].max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = MonitorConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_samples_above_max_rejected() {
        let mut config = MonitorConfig::default();
        config.cycle.min_samples = 10;
        config.cycle.max_samples = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_sample_buffer_rejected() {
        let mut config = MonitorConfig::default();
        config.cycle.min_samples = 1;
        config.cycle.max_samples = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_samples"));

        config.cycle.max_samples = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_alarm_targets_rejected() {
        let target = AlarmTargetConfig {
            name: "hmi".to_string(),
            url: "http://localhost:9000".to_string(),
            timeout_ms: 100,
            max_attempts: 2,
            backoff_ms: 10,
        };
        let mut config = MonitorConfig::default();
        config.alarm.targets = vec![target.clone(), target];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let polling = PollingConfig {
            period_ms: 10,
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            link_fault_threshold: 3,
        };
        assert_eq!(polling.backoff_for(0), Duration::from_millis(10));
        assert_eq!(polling.backoff_for(1), Duration::from_millis(100));
        assert_eq!(polling.backoff_for(2), Duration::from_millis(200));
        assert_eq!(polling.backoff_for(4), Duration::from_millis(800));
        assert_eq!(polling.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(polling.backoff_for(500), Duration::from_millis(1000));
    }
}
