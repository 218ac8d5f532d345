//! PLC poller
//!
//! Owns the sampling tick. Each tick reads one data block through the
//! [`ProtocolLink`], demultiplexes it into a [`RawFrame`] and feeds every channel's
//! state machine synchronously, so a frame is fully dispatched before the next read.
//! Completed windows are handed to the pipeline through the non-blocking
//! [`CycleQueue`]; nothing downstream can stall the tick.
//!
//! Link failures never stop the poller. They are counted in [`PollerStatus`] and the
//! next attempt is delayed with capped exponential backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use super::cycle_fsm::{ChannelView, CycleBank, CyclePolicy, CycleWindow};
use super::queue::{CycleQueue, PushOutcome};
use crate::config::{CycleConfig, LinkConfig, PollingConfig};
use crate::controller::{RunControl, RunState};
use crate::diagnostics::Diagnostics;
use crate::error::LinkError;
use crate::link::{with_timeout, ProtocolLink, RawFrame};

/// Link, liveness and per-channel state shared with the health monitor and
/// the controller
#[derive(Debug)]
pub struct PollerStatus {
    consecutive_failures: AtomicU32,
    last_heartbeat: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    channels: watch::Sender<Vec<ChannelView>>,
}

impl Default for PollerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerStatus {
    /// Status before the first tick
    pub fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            last_heartbeat: Mutex::new(None),
            last_error: Mutex::new(None),
            channels: watch::Sender::new(Vec::new()),
        }
    }

    /// Failed ticks since the last successful read
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Time of the last tick attempt
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock()
    }

    /// Message of the most recent link failure
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Per-channel detector state as of the latest tick or reset
    pub fn channels(&self) -> Vec<ChannelView> {
        self.channels.borrow().clone()
    }

    /// Watch per-channel detector state
    pub fn subscribe_channels(&self) -> watch::Receiver<Vec<ChannelView>> {
        self.channels.subscribe()
    }

    fn publish_channels(&self, views: Vec<ChannelView>) {
        self.channels.send_if_modified(|current| {
            if *current == views {
                false
            } else {
                *current = views;
                true
            }
        });
    }

    fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
    }

    fn record_failure(&self, error: &LinkError) -> u32 {
        *self.last_error.lock() = Some(error.to_string());
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_success(&self) -> u32 {
        self.consecutive_failures.swap(0, Ordering::SeqCst)
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A frame was dispatched; `completed` windows were handed to the pipeline
    Frame {
        /// Tick number of the frame
        tick: u64,
        /// Windows completed on this tick
        completed: usize,
    },
    /// The read or reconnect failed
    LinkFailed(LinkError),
}

/// Settings the poller needs
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Link timeouts and block layout
    pub link: LinkConfig,
    /// Period and backoff
    pub polling: PollingConfig,
    /// Cycle detection policy
    pub cycle: CycleConfig,
}

/// Sampling loop over one PLC link
pub struct Poller {
    link: Arc<dyn ProtocolLink>,
    settings: PollerSettings,
    bank: CycleBank,
    queue: Arc<CycleQueue>,
    diagnostics: Arc<Diagnostics>,
    status: Arc<PollerStatus>,
    next_tick: u64,
    ever_connected: bool,
}

impl Poller {
    /// Poller over `link` with every channel idle
    pub fn new(
        link: Arc<dyn ProtocolLink>,
        settings: PollerSettings,
        queue: Arc<CycleQueue>,
        diagnostics: Arc<Diagnostics>,
        status: Arc<PollerStatus>,
    ) -> Self {
        let bank = CycleBank::new(
            settings.link.layout.channel_count,
            CyclePolicy::from(&settings.cycle),
        );
        status.publish_channels(bank.views());
        Self {
            link,
            settings,
            bank,
            queue,
            diagnostics,
            status,
            next_tick: 0,
            ever_connected: false,
        }
    }

    /// Channel detectors
    pub fn bank(&self) -> &CycleBank {
        &self.bank
    }

    /// Read, demultiplex and dispatch one frame
    pub async fn tick(&mut self) -> TickOutcome {
        self.status.heartbeat();

        match self.read_frame().await {
            Ok(frame) => {
                self.diagnostics.record_poll();
                let failures = self.status.record_success();
                if failures > 0 {
                    tracing::info!(after_failures = failures, "PLC link recovered");
                }

                let completed = self.bank.on_frame(&frame, &self.diagnostics);
                self.status.publish_channels(self.bank.views());
                let count = completed.len();
                for window in completed {
                    self.enqueue(window);
                }
                TickOutcome::Frame {
                    tick: frame.tick(),
                    completed: count,
                }
            }
            Err(error) => {
                self.diagnostics.record_link_failure();
                let failures = self.status.record_failure(&error);
                let threshold = self.settings.polling.link_fault_threshold;
                if failures == threshold {
                    tracing::error!(%error, failures, "PLC link fault threshold reached");
                } else {
                    tracing::warn!(%error, failures, "PLC poll failed");
                }
                if !matches!(error, LinkError::MalformedBlock { .. }) {
                    self.link.disconnect().await;
                }
                TickOutcome::LinkFailed(error)
            }
        }
    }

    async fn read_frame(&mut self) -> Result<RawFrame, LinkError> {
        let link_cfg = &self.settings.link;

        if !self.link.is_connected() {
            with_timeout("connect", link_cfg.connect_timeout(), self.link.connect()).await?;
            if self.ever_connected {
                self.diagnostics.record_reconnect();
                tracing::info!(link = self.link.name(), "PLC link reconnected");
            } else {
                tracing::info!(link = self.link.name(), "PLC link connected");
            }
            self.ever_connected = true;
        }

        let block = with_timeout("read", link_cfg.read_timeout(), self.link.read_block()).await?;
        let frame = link_cfg.layout.decode(&block, self.next_tick)?;
        self.next_tick += 1;
        Ok(frame)
    }

    fn enqueue(&self, window: Arc<CycleWindow>) {
        match self.queue.push(window) {
            PushOutcome::Queued => {}
            PushOutcome::Evicted(old) => {
                self.diagnostics.record_queue_overflow();
                tracing::warn!(
                    channel = old.channel(),
                    sequence = old.sequence(),
                    "Cycle queue full, oldest window dropped"
                );
            }
            PushOutcome::Rejected(new) => {
                self.diagnostics.record_queue_overflow();
                tracing::warn!(
                    channel = new.channel(),
                    sequence = new.sequence(),
                    "Cycle queue full, new window dropped"
                );
            }
            PushOutcome::Closed(new) => {
                tracing::info!(
                    channel = new.channel(),
                    sequence = new.sequence(),
                    "Cycle queue closed, window dropped during shutdown"
                );
            }
        }
    }

    /// Drive the poller from run-state changes until shutdown.
    ///
    /// A state change is observed between ticks, so the tick in progress always
    /// completes before a pause or stop resets the channels. Every halt recorded in
    /// [`RunControl::halts`] resets the channels, including one already followed
    /// by a resume.
    pub async fn run(mut self, mut state: watch::Receiver<RunControl>) {
        let mut previous = RunControl::new(RunState::Stopped);
        tracing::info!(
            channels = self.bank.len(),
            period_ms = self.settings.polling.period_ms,
            "Poller task started"
        );

        loop {
            let current = *state.borrow_and_update();

            if current != previous {
                self.on_state_change(previous, current).await;
                previous = current;
            }

            match current.state {
                RunState::Running => {
                    let started = Instant::now();
                    self.tick().await;
                    let delay = self
                        .settings
                        .polling
                        .backoff_for(self.status.consecutive_failures());

                    tokio::select! {
                        _ = sleep_until(started + delay) => {}
                        changed = state.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                RunState::Paused | RunState::Stopped => {
                    if state.changed().await.is_err() {
                        break;
                    }
                }
                RunState::ShutDown => break,
            }
        }

        if self.link.is_connected() {
            self.link.disconnect().await;
        }
        tracing::info!("Poller task stopped");
    }

    async fn on_state_change(&mut self, from: RunControl, to: RunControl) {
        tracing::info!(from = ?from.state, to = ?to.state, halts = to.halts, "Poller state change");
        if to.halted_since(&from) {
            self.bank.reset_all(&self.diagnostics);
            self.status.publish_channels(self.bank.views());
        }
        if matches!(to.state, RunState::Stopped | RunState::ShutDown) && self.link.is_connected() {
            self.link.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::queue::OverflowPolicy;
    use crate::link::layout::BlockLayout;
    use crate::link::mock::{MockCycleShape, MockLink};
    use std::time::Duration;

    fn settings() -> PollerSettings {
        let mut settings = PollerSettings {
            link: LinkConfig::default(),
            polling: PollingConfig::default(),
            cycle: CycleConfig::default(),
        };
        settings.link.layout = BlockLayout {
            channel_count: 2,
            ..Default::default()
        };
        settings.cycle.min_samples = 3;
        settings.cycle.min_duration_ms = 0;
        settings
    }

    fn poller(link: Arc<MockLink>) -> (Poller, Arc<CycleQueue>, Arc<Diagnostics>, Arc<PollerStatus>) {
        let queue = Arc::new(CycleQueue::new(16, OverflowPolicy::DropOldest));
        let diagnostics = Arc::new(Diagnostics::new());
        let status = Arc::new(PollerStatus::new());
        let poller = Poller::new(link, settings(), queue.clone(), diagnostics.clone(), status.clone());
        (poller, queue, diagnostics, status)
    }

    #[tokio::test]
    async fn test_tick_connects_and_dispatches() {
        let link = Arc::new(MockLink::new(settings().link.layout));
        let (mut poller, _, diagnostics, status) = poller(link.clone());

        assert_eq!(poller.tick().await, TickOutcome::Frame { tick: 0, completed: 0 });
        assert!(link.is_connected());
        assert_eq!(diagnostics.snapshot().polls, 1);
        assert!(status.last_heartbeat().is_some());
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_cleared() {
        let link = Arc::new(MockLink::new(settings().link.layout));
        let (mut poller, _, diagnostics, status) = poller(link.clone());
        poller.tick().await;

        link.inject_failures(3);
        for expected in 1..=3 {
            assert!(matches!(poller.tick().await, TickOutcome::LinkFailed(_)));
            assert_eq!(status.consecutive_failures(), expected);
        }
        assert!(status.last_error().is_some());

        assert!(matches!(poller.tick().await, TickOutcome::Frame { .. }));
        assert_eq!(status.consecutive_failures(), 0);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.link_failures, 3);
        assert_eq!(snap.reconnects, 1);
    }

    #[tokio::test]
    async fn test_completed_cycles_reach_queue() {
        let shape = MockCycleShape {
            period_reads: 20,
            test_reads: 8,
        };
        let link = Arc::new(MockLink::with_shape(settings().link.layout, shape));
        let (mut poller, queue, diagnostics, _) = poller(link);

        for _ in 0..60 {
            poller.tick().await;
        }
        assert!(!queue.is_empty());
        assert_eq!(diagnostics.snapshot().cycles_completed as usize, queue.len());

        let first = queue.pop().await.unwrap();
        assert_eq!(first.len(), 8);
    }

    fn command(tx: &watch::Sender<RunControl>, to: RunState) {
        tx.send_modify(|control| *control = control.advance(to));
    }

    fn long_cycles(link_layout: BlockLayout) -> Arc<MockLink> {
        let shape = MockCycleShape {
            period_reads: 100,
            test_reads: 90,
        };
        Arc::new(MockLink::with_shape(link_layout, shape))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resets_in_flight_cycles() {
        let link = long_cycles(settings().link.layout);
        let (poller, _, diagnostics, status) = poller(link.clone());
        let (tx, rx) = watch::channel(RunControl::new(RunState::Stopped));
        let task = tokio::spawn(poller.run(rx));

        command(&tx, RunState::Running);
        tokio::time::sleep(Duration::from_millis(15_050)).await;
        assert!(status.channels().iter().any(|c| c.buffered > 0));

        command(&tx, RunState::Paused);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(diagnostics.snapshot().cycles_discarded >= 1);
        assert!(status.channels().iter().all(|c| c.buffered == 0));
        let polls = diagnostics.snapshot().polls;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(diagnostics.snapshot().polls, polls);
        assert!(link.is_connected());

        command(&tx, RunState::ShutDown);
        task.await.unwrap();
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_immediately_followed_by_resume_still_resets() {
        let link = long_cycles(settings().link.layout);
        let (poller, _, diagnostics, status) = poller(link);
        let (tx, rx) = watch::channel(RunControl::new(RunState::Stopped));
        let task = tokio::spawn(poller.run(rx));

        command(&tx, RunState::Running);
        tokio::time::sleep(Duration::from_millis(15_050)).await;
        assert!(status.channels().iter().all(|c| c.buffered > 0));
        let completed = diagnostics.snapshot().cycles_completed;

        // No yield in between: the poller only ever sees the final value
        command(&tx, RunState::Paused);
        command(&tx, RunState::Running);

        // Both in-flight cycles would have ended by now; after the reset neither
        // channel has seen a new rising edge yet
        tokio::time::sleep(Duration::from_millis(800)).await;
        let snap = diagnostics.snapshot();
        assert_eq!(snap.cycles_discarded, 2);
        assert_eq!(snap.cycles_completed, completed);

        command(&tx, RunState::ShutDown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_is_not_an_overflow() {
        let shape = MockCycleShape {
            period_reads: 20,
            test_reads: 8,
        };
        let link = Arc::new(MockLink::with_shape(settings().link.layout, shape));
        let (mut poller, queue, diagnostics, _) = poller(link);
        queue.close();

        for _ in 0..60 {
            poller.tick().await;
        }
        let snap = diagnostics.snapshot();
        assert!(snap.cycles_completed > 0);
        assert_eq!(snap.queue_overflows, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_tick_publishes_channel_views() {
        let link = Arc::new(MockLink::new(settings().link.layout));
        let (mut poller, _, _, status) = poller(link);
        assert_eq!(status.channels().len(), 2);

        let mut views = status.subscribe_channels();
        views.mark_unchanged();
        poller.tick().await;
        let published = views.borrow_and_update().clone();
        assert_eq!(published, poller.bank().views());
        assert_eq!(published[1].channel, 1);
    }
}
