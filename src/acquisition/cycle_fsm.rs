//! Per-channel test cycle state machine.
//!
//! Each channel runs an independent `IDLE -> ARMED -> COLLECTING -> EVALUATING -> IDLE`
//! machine fed one sample per poll tick. The transition table is the pure function
//! [`transition`]; [`ChannelFsm`] owns the buffer and applies the actions it returns.
//!
//! ```text
//!            rising edge              active              inactive / limit
//!   IDLE ──────────────────▶ ARMED ──────────▶ COLLECTING ─────────────────▶ EVALUATING
//!    ▲                         │ inactive / limit                                  │
//!    │                         └───────────────────────────────────────────────────┤
//!    └──────────────────────────── accepted (emit) / rejected (abort) ─────────────┘
//! ```
//!
//! Evaluation completes within the tick that ended collection, so a sample never
//! legitimately arrives in `EVALUATING`. If one does the channel is forced back to
//! `IDLE` and the violation is reported.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CycleConfig;
use crate::diagnostics::Diagnostics;
use crate::error::FsmProtocolViolation;
use crate::link::{ChannelId, ChannelSample, RawFrame};

/// State of one channel's cycle detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    /// No active cycle, buffer empty
    Idle,
    /// Rising edge seen; the arming sample is buffered
    Armed,
    /// Accumulating samples
    Collecting,
    /// Collection ended; the buffer is being checked
    Evaluating,
}

/// What starts and ends a test cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSource {
    /// The status bit of the channel record
    #[default]
    StatusBit,
    /// Pressure falls by `start_drop` between two ticks to start, then rises by
    /// `end_rise` between two ticks to end
    PressureDrop {
        /// Drop between two ticks that starts a cycle
        start_drop: f64,
        /// Rise between two ticks that ends it
        end_rise: f64,
    },
}

/// Why collection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Trigger went inactive
    Normal,
    /// Buffer reached the maximum duration
    MaxDuration,
    /// Buffer reached the maximum sample count
    BufferFull,
}

impl Termination {
    /// True if a collection limit, not the trigger, ended the cycle
    pub fn is_forced(self) -> bool {
        !matches!(self, Termination::Normal)
    }
}

/// Input to [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    /// One sample, already interpreted against the trigger.
    ///
    /// `rising_edge` is only true after an observed inactive-to-active change.
    /// `limit` is set when appending this sample reaches a collection limit.
    Sample {
        /// Trigger is active on this sample
        active: bool,
        /// Inactive-to-active change observed on this sample
        rising_edge: bool,
        /// Collection limit reached by appending this sample
        limit: Option<Termination>,
    },
    /// Result of evaluating a finished buffer
    Evaluated {
        /// Minimums and plausibility were satisfied
        accepted: bool,
    },
    /// Operator reset (pause, stop)
    Reset,
}

/// Buffer operation requested by [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleAction {
    /// Leave the buffer alone
    None,
    /// Clear the buffer and start it with this sample
    Start,
    /// Append this sample
    Append,
    /// Append this sample, then stop collecting
    AppendAndFinish(Termination),
    /// Stop collecting without this sample
    Finish(Termination),
    /// Emit the buffer as a completed window
    Emit,
    /// Drop the buffer as a spurious trigger
    Abort,
    /// Drop the buffer on reset
    Discard,
}

/// Pure transition table.
///
/// Returns the next state and the buffer action. A sample in `EVALUATING`, or an
/// evaluation result outside it, is a protocol violation.
pub fn transition(
    state: CycleState,
    event: CycleEvent,
) -> Result<(CycleState, CycleAction), CycleState> {
    use CycleAction as A;
    use CycleState as S;

    match (state, event) {
        (_, CycleEvent::Reset) => {
            let action = if state == S::Idle { A::None } else { A::Discard };
            Ok((S::Idle, action))
        }

        (S::Idle, CycleEvent::Sample {
            rising_edge: true, ..
        }) => Ok((S::Armed, A::Start)),
        (S::Idle, CycleEvent::Sample { .. }) => Ok((S::Idle, A::None)),

        // Inactive wins over a limit reached on the same tick
        (S::Armed | S::Collecting, CycleEvent::Sample { active: false, .. }) => {
            Ok((S::Evaluating, A::Finish(Termination::Normal)))
        }
        (S::Armed | S::Collecting, CycleEvent::Sample {
            limit: Some(reason),
            ..
        }) => Ok((S::Evaluating, A::AppendAndFinish(reason))),
        (S::Armed | S::Collecting, CycleEvent::Sample { .. }) => Ok((S::Collecting, A::Append)),

        (S::Evaluating, CycleEvent::Evaluated { accepted: true }) => Ok((S::Idle, A::Emit)),
        (S::Evaluating, CycleEvent::Evaluated { accepted: false }) => Ok((S::Idle, A::Abort)),

        (S::Evaluating, CycleEvent::Sample { .. }) | (_, CycleEvent::Evaluated { .. }) => {
            Err(state)
        }
    }
}

/// A completed, accepted test cycle for one channel.
///
/// Immutable once emitted; shared with the pipeline and storage as `Arc<CycleWindow>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleWindow {
    channel: ChannelId,
    sequence: u64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    first_tick: u64,
    last_tick: u64,
    termination: Termination,
    samples: Vec<ChannelSample>,
}

impl CycleWindow {
    /// Channel the window was collected on
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Per-channel sequence number, starting at 1
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time of the first sample
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Capture time of the last sample
    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// First and last poll tick in the window
    pub fn ticks(&self) -> (u64, u64) {
        (self.first_tick, self.last_tick)
    }

    /// Why collection stopped
    pub fn termination(&self) -> Termination {
        self.termination
    }

    /// Samples in capture order
    pub fn samples(&self) -> &[ChannelSample] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for a window without samples; emitted windows never are
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Pressure of every sample in capture order
    pub fn pressures(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.pressure)
    }

    /// Time between the first and last sample
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Reason a finished buffer was not emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Fewer samples than the minimum
    TooFewSamples(usize),
    /// Shorter than the minimum duration
    TooShort(Duration),
    /// A pressure was outside the plausible range
    Implausible,
}

/// Result of feeding one sample to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// Nothing to report
    Continue,
    /// Collection started on this sample
    Armed,
    /// The buffer was accepted and emitted
    Completed(Arc<CycleWindow>),
    /// The buffer was dropped
    Aborted(Rejection),
    /// The sample broke the protocol; the channel was forced to `IDLE`
    Violation(FsmProtocolViolation),
}

/// Limits and trigger interpretation for every channel
#[derive(Debug, Clone, PartialEq)]
pub struct CyclePolicy {
    /// Source of the active signal
    pub trigger: TriggerSource,
    /// Fewer samples abort the cycle
    pub min_samples: usize,
    /// Shorter cycles are aborted
    pub min_duration: Duration,
    /// Collection is forced to end at this duration
    pub max_duration: Duration,
    /// Collection is forced to end at this many samples
    pub max_samples: usize,
    /// Plausible pressure range, inclusive
    pub pressure_range: [f64; 2],
}

impl From<&CycleConfig> for CyclePolicy {
    fn from(config: &CycleConfig) -> Self {
        Self {
            trigger: config.trigger,
            min_samples: config.min_samples,
            min_duration: config.min_duration(),
            max_duration: config.max_duration(),
            max_samples: config.max_samples.max(2),
            pressure_range: config.pressure_range,
        }
    }
}

impl CyclePolicy {
    fn plausible(&self, pressure: f64) -> bool {
        pressure.is_finite() && pressure >= self.pressure_range[0] && pressure <= self.pressure_range[1]
    }
}

/// One channel's detector and sample buffer
#[derive(Debug)]
pub struct ChannelFsm {
    channel: ChannelId,
    state: CycleState,
    buffer: Vec<ChannelSample>,
    termination: Option<Termination>,
    last_active: Option<bool>,
    last_pressure: Option<f64>,
    last_tick: Option<u64>,
    last_timestamp: Option<DateTime<Utc>>,
    next_sequence: u64,
}

impl ChannelFsm {
    /// Idle detector for `channel`
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            state: CycleState::Idle,
            buffer: Vec::new(),
            termination: None,
            last_active: None,
            last_pressure: None,
            last_tick: None,
            last_timestamp: None,
            next_sequence: 1,
        }
    }

    /// Channel this detector serves
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Current state
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Samples currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence number the next emitted window will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Feed one sample. Evaluation of a finished buffer happens before returning.
    pub fn on_sample(&mut self, sample: &ChannelSample, policy: &CyclePolicy) -> SampleOutcome {
        if sample.channel != self.channel {
            return self.violate(FsmProtocolViolation::WrongChannel {
                expected: self.channel,
                actual: sample.channel,
            });
        }
        if let Some(last_tick) = self.last_tick {
            let backwards = self
                .last_timestamp
                .is_some_and(|last| sample.captured_at < last);
            if sample.tick <= last_tick || backwards {
                return self.violate(FsmProtocolViolation::OutOfOrder {
                    channel: self.channel,
                    last_tick,
                    tick: sample.tick,
                });
            }
        }
        self.last_tick = Some(sample.tick);
        self.last_timestamp = Some(sample.captured_at);

        let active = self.interpret(sample, policy);
        let rising_edge = self.last_active == Some(false) && active;
        self.last_active = Some(active);

        let event = CycleEvent::Sample {
            active,
            rising_edge,
            limit: self.limit_after_append(sample, policy),
        };
        let (next, action) = match transition(self.state, event) {
            Ok(step) => step,
            Err(state) => {
                return self.violate(FsmProtocolViolation::UnexpectedState {
                    channel: self.channel,
                    state,
                })
            }
        };
        self.state = next;

        match action {
            CycleAction::Start => {
                self.buffer.clear();
                self.buffer.push(*sample);
                SampleOutcome::Armed
            }
            CycleAction::Append => {
                self.buffer.push(*sample);
                SampleOutcome::Continue
            }
            CycleAction::AppendAndFinish(reason) => {
                self.buffer.push(*sample);
                self.termination = Some(reason);
                self.evaluate(policy)
            }
            CycleAction::Finish(reason) => {
                self.termination = Some(reason);
                self.evaluate(policy)
            }
            _ => SampleOutcome::Continue,
        }
    }

    /// Force the channel to `IDLE`, dropping any in-flight buffer.
    ///
    /// Returns true if a buffer was discarded. A new cycle needs a fresh
    /// inactive-to-active edge after a reset.
    pub fn reset(&mut self) -> bool {
        let discarded = matches!(
            transition(self.state, CycleEvent::Reset),
            Ok((_, CycleAction::Discard))
        );
        self.state = CycleState::Idle;
        self.buffer.clear();
        self.termination = None;
        self.last_active = None;
        self.last_pressure = None;
        discarded
    }

    fn interpret(&mut self, sample: &ChannelSample, policy: &CyclePolicy) -> bool {
        match policy.trigger {
            TriggerSource::StatusBit => sample.status.unwrap_or(false),
            TriggerSource::PressureDrop {
                start_drop,
                end_rise,
            } => {
                let was_active = self.last_active.unwrap_or(false);
                let active = match self.last_pressure {
                    Some(prev) if !was_active => prev - sample.pressure >= start_drop,
                    Some(prev) => sample.pressure - prev < end_rise,
                    None => false,
                };
                self.last_pressure = Some(sample.pressure);
                active
            }
        }
    }

    fn limit_after_append(&self, sample: &ChannelSample, policy: &CyclePolicy) -> Option<Termination> {
        if !matches!(self.state, CycleState::Armed | CycleState::Collecting) {
            return None;
        }
        if self.buffer.len() + 1 >= policy.max_samples {
            return Some(Termination::BufferFull);
        }
        let first = self.buffer.first()?;
        let elapsed = (sample.captured_at - first.captured_at)
            .to_std()
            .unwrap_or_default();
        (elapsed >= policy.max_duration).then_some(Termination::MaxDuration)
    }

    fn evaluate(&mut self, policy: &CyclePolicy) -> SampleOutcome {
        let rejection = self.check(policy);
        let accepted = rejection.is_none();

        // Only Emit or Abort can follow from EVALUATING
        let (next, action) = match transition(self.state, CycleEvent::Evaluated { accepted }) {
            Ok(step) => step,
            Err(state) => {
                return self.violate(FsmProtocolViolation::UnexpectedEvaluation {
                    channel: self.channel,
                    state,
                })
            }
        };
        self.state = next;

        let termination = self.termination.take().unwrap_or(Termination::Normal);
        let samples = std::mem::take(&mut self.buffer);

        match (action, rejection) {
            (CycleAction::Emit, _) => {
                let (first, last) = match (samples.first(), samples.last()) {
                    (Some(first), Some(last)) => (*first, *last),
                    _ => return SampleOutcome::Aborted(Rejection::TooFewSamples(0)),
                };
                let window = CycleWindow {
                    channel: self.channel,
                    sequence: self.next_sequence,
                    started_at: first.captured_at,
                    ended_at: last.captured_at,
                    first_tick: first.tick,
                    last_tick: last.tick,
                    termination,
                    samples,
                };
                self.next_sequence += 1;
                SampleOutcome::Completed(Arc::new(window))
            }
            (_, Some(reason)) => SampleOutcome::Aborted(reason),
            (_, None) => SampleOutcome::Continue,
        }
    }

    fn check(&self, policy: &CyclePolicy) -> Option<Rejection> {
        let count = self.buffer.len();
        if count < policy.min_samples {
            return Some(Rejection::TooFewSamples(count));
        }
        let duration = match (self.buffer.first(), self.buffer.last()) {
            (Some(first), Some(last)) => (last.captured_at - first.captured_at)
                .to_std()
                .unwrap_or_default(),
            _ => Duration::ZERO,
        };
        if duration < policy.min_duration {
            return Some(Rejection::TooShort(duration));
        }
        if !self.buffer.iter().all(|s| policy.plausible(s.pressure)) {
            return Some(Rejection::Implausible);
        }
        None
    }

    fn violate(&mut self, violation: FsmProtocolViolation) -> SampleOutcome {
        self.reset();
        SampleOutcome::Violation(violation)
    }
}

/// Read-only view of one channel's detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelView {
    /// Channel id
    pub channel: ChannelId,
    /// Current state
    pub state: CycleState,
    /// Samples currently buffered
    pub buffered: usize,
    /// Sequence number the next emitted window will carry
    pub next_sequence: u64,
}

impl From<&ChannelFsm> for ChannelView {
    fn from(fsm: &ChannelFsm) -> Self {
        Self {
            channel: fsm.channel,
            state: fsm.state,
            buffered: fsm.buffer.len(),
            next_sequence: fsm.next_sequence,
        }
    }
}

/// All channel detectors, driven one frame at a time by the poller.
#[derive(Debug)]
pub struct CycleBank {
    policy: CyclePolicy,
    channels: Vec<ChannelFsm>,
}

impl CycleBank {
    /// Idle detectors for channels `0..channel_count`
    pub fn new(channel_count: u16, policy: CyclePolicy) -> Self {
        Self {
            policy,
            channels: (0..channel_count).map(ChannelFsm::new).collect(),
        }
    }

    /// Detector for `channel`, if it exists
    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelFsm> {
        self.channels.get(usize::from(channel))
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True for a bank without channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Snapshot of every channel's detector, in channel order
    pub fn views(&self) -> Vec<ChannelView> {
        self.channels.iter().map(ChannelView::from).collect()
    }

    /// Feed every sample of a frame to its channel, in channel order.
    ///
    /// Completed windows are returned in channel order. Aborts and violations are
    /// counted and logged here; they never escape the channel they happened on.
    pub fn on_frame(&mut self, frame: &RawFrame, diagnostics: &Diagnostics) -> Vec<Arc<CycleWindow>> {
        let mut completed = Vec::new();

        for sample in frame.samples() {
            let Some(fsm) = self.channels.get_mut(usize::from(sample.channel)) else {
                tracing::warn!(channel = sample.channel, "Sample for unknown channel ignored");
                continue;
            };

            match fsm.on_sample(sample, &self.policy) {
                SampleOutcome::Continue => {}
                SampleOutcome::Armed => {
                    tracing::debug!(channel = sample.channel, tick = sample.tick, "Cycle armed");
                }
                SampleOutcome::Completed(window) => {
                    diagnostics.record_cycle_completed(window.termination().is_forced());
                    if window.termination().is_forced() {
                        tracing::warn!(
                            channel = window.channel(),
                            sequence = window.sequence(),
                            reason = ?window.termination(),
                            samples = window.len(),
                            "Cycle terminated by collection limit"
                        );
                    } else {
                        tracing::info!(
                            channel = window.channel(),
                            sequence = window.sequence(),
                            samples = window.len(),
                            duration_ms = window.duration().as_millis() as u64,
                            "Cycle completed"
                        );
                    }
                    completed.push(window);
                }
                SampleOutcome::Aborted(Rejection::Implausible) => {
                    diagnostics.record_implausible_cycle();
                    tracing::warn!(channel = sample.channel, "Cycle discarded: implausible pressure");
                }
                SampleOutcome::Aborted(reason) => {
                    diagnostics.record_cycle_aborted();
                    tracing::debug!(channel = sample.channel, ?reason, "Spurious trigger discarded");
                }
                SampleOutcome::Violation(violation) => {
                    diagnostics.record_fsm_violation();
                    tracing::error!(channel = sample.channel, %violation, "Cycle state machine fault");
                }
            }
        }

        completed
    }

    /// Reset every channel to `IDLE`. Returns the number of discarded buffers.
    pub fn reset_all(&mut self, diagnostics: &Diagnostics) -> usize {
        let discarded = self
            .channels
            .iter_mut()
            .map(ChannelFsm::reset)
            .filter(|discarded| *discarded)
            .count();
        for _ in 0..discarded {
            diagnostics.record_cycle_discarded();
        }
        if discarded > 0 {
            tracing::info!(discarded, "In-flight cycles discarded on reset");
        }
        discarded
    }
}
