//! # Leak DAQ
//!
//! Edge monitor for a bank of leak-test cavities read through a PLC data block.
//! It samples the block at a fixed period, detects test-cycle boundaries per channel,
//! classifies every completed cycle, and watches its own health.
//!
//! ## Crate Structure
//!
//! - **`link`**: the `ProtocolLink` seam, block demultiplexing, and the mock PLC.
//! - **`acquisition`**: the poller, the per-channel cycle state machine, and the bounded
//!   queue of completed cycles.
//! - **`pipeline`**: feature extraction, classification, write-back and persistence of
//!   each completed cycle.
//! - **`storage`**: the `Storage` seam with in-memory and JSON-lines backends.
//! - **`health`**: fault taxonomy and the periodic health monitor.
//! - **`alarm`**: non-blocking alarm fan-out to HTTP targets with bounded retry.
//! - **`controller`**: task wiring and the start / stop / pause / resume / health-check
//!   command surface.
//! - **`console`**: the interactive stdin front end used by the binary.
//! - **`config`**, **`logging`**, **`diagnostics`**, **`error`**: ambient infrastructure.

pub mod acquisition;
pub mod alarm;
pub mod config;
pub mod console;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod link;
pub mod logging;
pub mod pipeline;
pub mod storage;

pub use config::MonitorConfig;
pub use controller::{Collaborators, Monitor, MonitorDiagnostics, RunControl, RunState};
pub use error::{MonitorError, MonitorResult};
