//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use leak_daq::acquisition::cycle_fsm::CyclePolicy;
use leak_daq::acquisition::{CycleBank, CycleWindow, TriggerSource};
use leak_daq::alarm::{AlarmPayload, AlarmTarget};
use leak_daq::diagnostics::Diagnostics;
use leak_daq::error::{AlarmDeliveryError, ClassifierError, LinkError};
use leak_daq::link::layout::{BlockLayout, RecordValues};
use leak_daq::link::{ChannelId, ChannelSample, ProtocolLink, RawBlock, RawFrame};
use leak_daq::pipeline::classifier::Classifier;

/// Simulated time between successful reads
pub const TICK_MS: i64 = 10;

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap_or_default()
}

pub fn layout(channels: u16) -> BlockLayout {
    BlockLayout {
        channel_count: channels,
        ..Default::default()
    }
}

enum Step {
    Frame(Vec<(bool, f64)>),
    Fail,
}

/// Link replaying a script of frames and failures.
///
/// Capture times advance by [`TICK_MS`] per successful read. Once the script runs
/// out every channel reads idle.
pub struct ScriptedLink {
    layout: BlockLayout,
    script: Mutex<VecDeque<Step>>,
    reads: AtomicU64,
    connected: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<(u16, usize, i16)>>,
}

impl ScriptedLink {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            script: Mutex::new(VecDeque::new()),
            reads: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Queue `count` frames where every channel has the same status and pressure
    pub fn push_frames(&self, count: usize, active: bool, pressure: f64) {
        let channels = usize::from(self.layout.channel_count);
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Step::Frame(vec![(active, pressure); channels]));
        }
    }

    /// Queue one frame with per-channel `(active, pressure)` values
    pub fn push_frame(&self, channels: Vec<(bool, f64)>) {
        self.script.lock().push_back(Step::Frame(channels));
    }

    pub fn push_failures(&self, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Step::Fail);
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    pub fn writes(&self) -> Vec<(u16, usize, i16)> {
        self.writes.lock().clone()
    }

    fn encode(&self, channels: &[(bool, f64)]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.layout.block_len());
        for (index, (active, pressure)) in channels.iter().enumerate() {
            self.layout.encode_record(
                &RecordValues {
                    ai: index as i16,
                    pressure: *pressure,
                    position: 0,
                    angle: 0.0,
                    active: *active,
                },
                &mut bytes,
            );
        }
        bytes
    }
}

#[async_trait]
impl ProtocolLink for ScriptedLink {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// A pending scripted failure also fails the connect attempt
    async fn connect(&self) -> Result<(), LinkError> {
        let mut script = self.script.lock();
        if matches!(script.front(), Some(Step::Fail)) {
            script.pop_front();
            return Err(LinkError::Connect("scripted failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_block(&self) -> Result<RawBlock, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let step = self.script.lock().pop_front();
        let channels = match step {
            Some(Step::Fail) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(LinkError::Read("scripted failure".to_string()));
            }
            Some(Step::Frame(channels)) => channels,
            None => vec![(false, 950.0); usize::from(self.layout.channel_count)],
        };
        let read = self.reads.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(RawBlock {
            bytes: Bytes::from(self.encode(&channels)),
            captured_at: epoch() + chrono::Duration::milliseconds(read * TICK_MS),
        })
    }

    async fn write_word(&self, db: u16, offset: usize, value: i16) -> Result<(), LinkError> {
        if self.fail_writes.load(Ordering::SeqCst) || !self.is_connected() {
            return Err(LinkError::Write("scripted write failure".to_string()));
        }
        self.writes.lock().push((db, offset, value));
        Ok(())
    }
}

/// Classifier returning scripted outcomes, then a fixed probability
pub struct ScriptedClassifier {
    outcomes: Mutex<VecDeque<Result<f64, ClassifierError>>>,
    fallback: f64,
    calls: AtomicU32,
}

impl ScriptedClassifier {
    pub fn new(fallback: f64) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
        }
    }

    pub fn then(self, outcome: Result<f64, ClassifierError>) -> Self {
        self.outcomes.lock().push_back(outcome);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for ScriptedClassifier {
    fn is_loaded(&self) -> bool {
        true
    }

    fn version(&self) -> &str {
        "scripted-1"
    }

    fn classify(&self, _features: &[f64]) -> Result<f64, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or(Ok(self.fallback))
    }
}

/// Alarm target recording every payload, optionally failing every attempt
pub struct RecordingTarget {
    name: String,
    fail: bool,
    delay: Duration,
    attempts: AtomicU32,
    delivered: Mutex<Vec<serde_json::Value>>,
}

impl RecordingTarget {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            delay: Duration::ZERO,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn slow(name: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(name)
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<serde_json::Value> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl AlarmTarget for RecordingTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, payload: &AlarmPayload<'_>) -> Result<(), AlarmDeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(AlarmDeliveryError::Rejected {
                target: self.name.clone(),
                status: 503,
            });
        }
        let value = serde_json::to_value(payload).map_err(|e| AlarmDeliveryError::Transport {
            target: self.name.clone(),
            message: e.to_string(),
        })?;
        self.delivered.lock().push(value);
        Ok(())
    }
}

/// Policy with no duration limits worth hitting in tests
pub fn policy(min_samples: usize) -> CyclePolicy {
    CyclePolicy {
        trigger: TriggerSource::StatusBit,
        min_samples,
        min_duration: Duration::ZERO,
        max_duration: Duration::from_secs(3600),
        max_samples: 10_000,
        pressure_range: [0.0, 2000.0],
    }
}

/// Run one channel through an idle sample, `pressures` active samples and a
/// closing idle sample, returning the completed window
pub fn completed_window(channel: ChannelId, pressures: &[f64]) -> Option<Arc<CycleWindow>> {
    let mut bank = CycleBank::new(channel + 1, policy(2));
    let diagnostics = Diagnostics::new();
    let mut statuses = vec![(false, 950.0)];
    statuses.extend(pressures.iter().map(|p| (true, *p)));
    statuses.push((false, 950.0));

    let mut completed = Vec::new();
    for (tick, (active, pressure)) in statuses.into_iter().enumerate() {
        let captured_at = epoch() + chrono::Duration::milliseconds(tick as i64 * TICK_MS);
        let samples = (0..=channel)
            .map(|ch| ChannelSample {
                channel: ch,
                tick: tick as u64,
                captured_at,
                ai: 0,
                pressure: if ch == channel { pressure } else { 950.0 },
                position: 0,
                angle: 0.0,
                status: Some(ch == channel && active),
            })
            .collect();
        let frame = RawFrame::new(tick as u64, captured_at, samples);
        completed.extend(bank.on_frame(&frame, &diagnostics));
    }
    completed.pop()
}

/// Poll `condition` every 10 ms until it holds or `limit` elapses
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
