//! Error types for the monitor.
//!
//! Every failure domain of the acquisition core has its own `thiserror` enum so that
//! callers can isolate a failure to the smallest affected scope (one channel, one
//! cycle, one alarm target) instead of propagating a catch-all error across
//! component boundaries:
//!
//! - **`LinkError`**: transient PLC link failures. Always retried with backoff, never fatal.
//! - **`ClassifierError`**: per-cycle. Aborts that cycle's result only.
//! - **`StorageError`**: per-cycle. Raises a fault, never blocks the pipeline.
//! - **`AlarmDeliveryError`**: per-target. Retried up to a bound, then dropped.
//! - **`FsmProtocolViolation`**: a logic fault inside one channel's state machine. The
//!   channel is forced back to `IDLE` and the violation is counted.
//! - **`FeatureError`**: malformed input to the feature extractor.
//!
//! `MonitorError` is the top-level type used for start-up and configuration, where a
//! failure does stop the process.

use std::time::Duration;

use thiserror::Error;

use crate::acquisition::cycle_fsm::CycleState;
use crate::link::ChannelId;

/// Convenience alias for results using the top-level error type.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// PLC link failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// No session is open
    #[error("PLC link not connected")]
    NotConnected,

    /// Opening the session failed
    #[error("PLC connection failed: {0}")]
    Connect(String),

    /// A link operation ran past its deadline
    #[error("PLC {operation} timed out after {timeout:?}")]
    Timeout {
        /// `connect`, `read` or `write`
        operation: &'static str,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Block read failed
    #[error("PLC read failed: {0}")]
    Read(String),

    /// Word write failed
    #[error("PLC write failed: {0}")]
    Write(String),

    /// Block shorter than the layout requires
    #[error("Malformed data block: expected at least {expected} bytes, got {actual}")]
    MalformedBlock {
        /// Bytes the layout needs
        expected: usize,
        /// Bytes received
        actual: usize,
    },
}

/// Classifier failures. Raised when no model is loaded or the input shape is wrong.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    /// Inference requested without a model
    #[error("No model loaded")]
    NotLoaded,

    /// Feature vector length differs from the model input
    #[error("Feature vector has {actual} values, model expects {expected}")]
    ShapeMismatch {
        /// Model input length
        expected: usize,
        /// Length of the supplied vector
        actual: usize,
    },

    /// Inference ran past its deadline
    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),

    /// Model artifact could not be read or parsed
    #[error("Failed to load model: {0}")]
    Load(String),

    /// The model itself failed
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Storage collaborator failures.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend is down
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A storage call ran past its deadline
    #[error("Storage {operation} timed out after {timeout:?}")]
    Timeout {
        /// Name of the storage call
        operation: &'static str,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Filesystem failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A single failed delivery attempt to one alarm target.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlarmDeliveryError {
    /// Non-success HTTP status
    #[error("Target '{target}' rejected alarm with HTTP {status}")]
    Rejected {
        /// Target name
        target: String,
        /// HTTP status code
        status: u16,
    },

    /// No response within the delivery timeout
    #[error("Target '{target}' timed out after {timeout:?}")]
    Timeout {
        /// Target name
        target: String,
        /// Per-attempt timeout
        timeout: Duration,
    },

    /// Connection or protocol failure
    #[error("Target '{target}' unreachable: {message}")]
    Transport {
        /// Target name
        target: String,
        /// Transport error text
        message: String,
    },
}

/// A sample arrived for a channel whose state machine cannot accept it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FsmProtocolViolation {
    /// The state has no transition for the sample
    #[error("Channel {channel}: sample arrived while in {state:?}")]
    UnexpectedState {
        /// Channel of the state machine
        channel: ChannelId,
        /// State at the time
        state: CycleState,
    },

    /// Tick is not newer than the last accepted one
    #[error("Channel {channel}: sample for tick {tick} arrived after tick {last_tick}")]
    OutOfOrder {
        /// Channel of the state machine
        channel: ChannelId,
        /// Last tick accepted
        last_tick: u64,
        /// Offending tick
        tick: u64,
    },

    /// Evaluation result outside `EVALUATING`
    #[error("Channel {channel}: evaluation result arrived while in {state:?}")]
    UnexpectedEvaluation {
        /// Channel of the state machine
        channel: ChannelId,
        /// State at the time
        state: CycleState,
    },

    /// Sample routed to the wrong state machine
    #[error("Channel {expected}: received sample addressed to channel {actual}")]
    WrongChannel {
        /// Channel of the state machine
        expected: ChannelId,
        /// Channel the sample names
        actual: ChannelId,
    },
}

/// Malformed input to the feature extractor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    /// Fewer than two samples
    #[error("Window has {0} samples, at least 2 are required")]
    TooFewSamples(usize),

    /// NaN or infinite pressure
    #[error("Window contains a non-finite pressure value")]
    NonFinite,
}

/// Top-level error for start-up, configuration and wiring.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Config sources could not be merged or extracted
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Extracted config failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Console or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Link failure surfaced at start-up
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Model could not be loaded
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    /// Storage backend could not be opened
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Subscriber or log file setup failed
    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    /// A command reached a monitor that already shut down
    #[error("Monitor is shut down")]
    ShutDown,
}

impl From<figment::Error> for MonitorError {
    fn from(value: figment::Error) -> Self {
        MonitorError::Config(Box::new(value))
    }
}
