//! Mock PLC link
//!
//! Simulates a bank of leak-test cavities for offline development:
//! - Each channel repeats an idle phase followed by a test phase
//! - Idle pressure sits around 950 with small noise
//! - During a test the pressure drops and then decays at a per-channel leak rate;
//!   every seventh channel (3, 10, 17, ...) leaks noticeably faster
//! - The status bit is set for the duration of the test phase
//! - Link failures can be injected to exercise the reconnect path
//!
//! All operations are non-blocking; the simulation advances one step per read.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;

use super::layout::{BlockLayout, RecordValues};
use super::{ProtocolLink, RawBlock};
use crate::error::LinkError;

/// Shape of the simulated test cycle, in reads
#[derive(Debug, Clone, Copy)]
pub struct MockCycleShape {
    /// Reads per full idle + test period
    pub period_reads: u64,
    /// Reads spent in the test phase
    pub test_reads: u64,
}

impl Default for MockCycleShape {
    fn default() -> Self {
        Self {
            period_reads: 600,
            test_reads: 400,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    reads: u64,
    fail_next: u32,
    writes: Vec<(u16, usize, i16)>,
}

/// Synthetic PLC link
pub struct MockLink {
    layout: BlockLayout,
    shape: MockCycleShape,
    connected: AtomicBool,
    state: Mutex<MockState>,
}

impl MockLink {
    /// Create a mock producing blocks for `layout`
    pub fn new(layout: BlockLayout) -> Self {
        Self::with_shape(layout, MockCycleShape::default())
    }

    /// Create a mock with a custom cycle shape
    pub fn with_shape(layout: BlockLayout, shape: MockCycleShape) -> Self {
        Self {
            layout,
            shape,
            connected: AtomicBool::new(false),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make the next `count` reads or connects fail; a failed read drops the connection
    pub fn inject_failures(&self, count: u32) {
        self.state.lock().fail_next += count;
    }

    /// Words written so far as `(db, offset, value)`
    pub fn writes(&self) -> Vec<(u16, usize, i16)> {
        self.state.lock().writes.clone()
    }

    fn build_block(&self, read: u64) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut bytes = Vec::with_capacity(self.layout.block_len());
        let period = self.shape.period_reads.max(1);

        for channel in 0..self.layout.channel_count {
            let channel = u64::from(channel);
            // Stagger channels so cycles do not all start on the same read
            let phase = (read + channel * 17) % period;
            let testing = phase < self.shape.test_reads;
            let leak_rate = if channel % 7 == 3 { 0.45 } else { 0.02 };

            let pressure = if testing {
                650.0 - leak_rate * phase as f64 + rng.gen_range(-0.5..0.5)
            } else {
                950.0 + rng.gen_range(-5.0..5.0)
            };
            let position = (read % 360) as i16;

            self.layout.encode_record(
                &RecordValues {
                    ai: (channel * 100) as i16 + rng.gen_range(0..10),
                    pressure,
                    position,
                    angle: f64::from(position) + rng.gen_range(-0.5..0.5),
                    active: testing,
                },
                &mut bytes,
            );
        }
        bytes
    }
}

#[async_trait]
impl ProtocolLink for MockLink {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        {
            let mut state = self.state.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(LinkError::Connect("mock: injected failure".to_string()));
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(channels = self.layout.channel_count, "MockLink connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_block(&self) -> Result<RawBlock, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let read = {
            let mut state = self.state.lock();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                self.connected.store(false, Ordering::SeqCst);
                return Err(LinkError::Read("mock: injected failure".to_string()));
            }
            state.reads += 1;
            state.reads
        };

        Ok(RawBlock {
            bytes: Bytes::from(self.build_block(read)),
            captured_at: Utc::now(),
        })
    }

    async fn write_word(&self, db: u16, offset: usize, value: i16) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        tracing::debug!(db, offset, value, "MockLink write");
        self.state.lock().writes.push((db, offset, value));
        Ok(())
    }
}
