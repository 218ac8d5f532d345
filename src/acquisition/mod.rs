//! Acquisition core: the sampling tick, per-channel cycle detection and the
//! hand-off of completed cycles to the pipeline.

pub mod cycle_fsm;
pub mod poller;
pub mod queue;

pub use cycle_fsm::{ChannelView, CycleBank, CycleState, CycleWindow, Termination, TriggerSource};
pub use poller::{Poller, PollerSettings, PollerStatus, TickOutcome};
pub use queue::{CycleQueue, OverflowPolicy, PushOutcome};
