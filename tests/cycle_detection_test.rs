//! End-to-end cycle detection through the poller and a scripted link.

mod common;

use std::sync::Arc;

use common::{layout, ScriptedLink};
use leak_daq::acquisition::{
    CycleQueue, CycleWindow, OverflowPolicy, Poller, PollerSettings, PollerStatus, Termination,
    TickOutcome,
};
use leak_daq::config::{CycleConfig, LinkConfig, PollingConfig};
use leak_daq::diagnostics::Diagnostics;

struct Harness {
    link: Arc<ScriptedLink>,
    poller: Poller,
    queue: Arc<CycleQueue>,
    diagnostics: Arc<Diagnostics>,
    status: Arc<PollerStatus>,
}

impl Harness {
    /// Poller over `channels` channels; min duration 10 ticks, min samples 5
    fn new(channels: u16, configure: impl FnOnce(&mut CycleConfig)) -> Self {
        let mut cycle = CycleConfig {
            min_samples: 5,
            min_duration_ms: 10 * common::TICK_MS as u64,
            ..Default::default()
        };
        configure(&mut cycle);
        let settings = PollerSettings {
            link: LinkConfig {
                layout: layout(channels),
                ..Default::default()
            },
            polling: PollingConfig::default(),
            cycle,
        };

        let link = Arc::new(ScriptedLink::new(layout(channels)));
        let queue = Arc::new(CycleQueue::new(64, OverflowPolicy::DropOldest));
        let diagnostics = Arc::new(Diagnostics::new());
        let status = Arc::new(PollerStatus::new());
        let poller = Poller::new(
            link.clone(),
            settings,
            queue.clone(),
            diagnostics.clone(),
            status.clone(),
        );
        Self {
            link,
            poller,
            queue,
            diagnostics,
            status,
        }
    }

    async fn run_script(&mut self) {
        while self.link.remaining() > 0 {
            self.poller.tick().await;
        }
    }

    async fn drain(&self) -> Vec<Arc<CycleWindow>> {
        let mut windows = Vec::new();
        while !self.queue.is_empty() {
            if let Some(window) = self.queue.pop().await {
                windows.push(window);
            }
        }
        windows
    }
}

#[tokio::test]
async fn test_forty_active_ticks_emit_one_window() {
    let mut h = Harness::new(1, |_| {});
    h.link.push_frames(1, false, 950.0);
    h.link.push_frames(40, true, 650.0);
    h.link.push_frames(1, false, 950.0);
    h.run_script().await;

    let windows = h.drain().await;
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].len(), 40);
    assert_eq!(windows[0].termination(), Termination::Normal);
    assert_eq!(windows[0].sequence(), 1);
    assert_eq!(h.diagnostics.snapshot().cycles_completed, 1);
}

#[tokio::test]
async fn test_two_active_ticks_are_aborted() {
    let mut h = Harness::new(1, |_| {});
    h.link.push_frames(1, false, 950.0);
    h.link.push_frames(2, true, 650.0);
    h.link.push_frames(1, false, 950.0);
    h.run_script().await;

    assert!(h.drain().await.is_empty());
    let snap = h.diagnostics.snapshot();
    assert_eq!(snap.cycles_completed, 0);
    assert_eq!(snap.cycles_aborted, 1);
}

#[tokio::test]
async fn test_stuck_status_is_forced_to_complete() {
    let mut h = Harness::new(1, |cycle| {
        cycle.max_duration_ms = 20 * common::TICK_MS as u64;
    });
    h.link.push_frames(1, false, 950.0);
    h.link.push_frames(100, true, 650.0);
    h.run_script().await;

    let windows = h.drain().await;
    // Still active afterwards, so no second edge and no second cycle
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].termination(), Termination::MaxDuration);
    assert_eq!(windows[0].len(), 21);
    assert_eq!(h.diagnostics.snapshot().cycles_forced, 1);
}

#[tokio::test]
async fn test_full_buffer_forces_termination() {
    let mut h = Harness::new(1, |cycle| {
        cycle.max_samples = 30;
    });
    h.link.push_frames(1, false, 950.0);
    h.link.push_frames(50, true, 650.0);
    h.run_script().await;

    let windows = h.drain().await;
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].termination(), Termination::BufferFull);
    assert_eq!(windows[0].len(), 30);
}

#[tokio::test]
async fn test_implausible_window_is_counted_not_emitted() {
    let mut h = Harness::new(1, |_| {});
    h.link.push_frames(1, false, 950.0);
    h.link.push_frames(20, true, 5000.0);
    h.link.push_frames(1, false, 950.0);
    h.run_script().await;

    assert!(h.drain().await.is_empty());
    assert_eq!(h.diagnostics.snapshot().implausible_cycles, 1);
}

#[tokio::test]
async fn test_windows_are_disjoint_with_increasing_sequences() {
    let mut h = Harness::new(3, |_| {});
    for round in 0..4 {
        h.link.push_frames(3, false, 950.0);
        for tick in 0..(15 + round * 5) {
            // Channel 1 lags channel 0 by a few ticks, channel 2 stays idle
            let lagging = tick >= 3;
            h.link.push_frame(vec![(true, 650.0), (lagging, 660.0), (false, 950.0)]);
        }
        h.link.push_frames(2, false, 950.0);
    }
    h.run_script().await;

    let windows = h.drain().await;
    assert_eq!(windows.len(), 8);
    assert!(windows.iter().all(|w| w.channel() != 2));

    for channel in 0..2 {
        let ours: Vec<_> = windows.iter().filter(|w| w.channel() == channel).collect();
        assert_eq!(ours.len(), 4);
        for pair in ours.windows(2) {
            assert!(pair[1].sequence() > pair[0].sequence());
            assert!(pair[1].ticks().0 > pair[0].ticks().1);
            assert!(pair[1].started_at() > pair[0].ended_at());
        }
    }
}

#[tokio::test]
async fn test_link_failures_do_not_stop_ticking() {
    let mut h = Harness::new(1, |_| {});
    h.link.push_frames(2, false, 950.0);
    h.link.push_failures(3);
    h.link.push_frames(1, false, 950.0);

    let mut outcomes = Vec::new();
    while h.link.remaining() > 0 {
        outcomes.push(h.poller.tick().await);
    }

    let failures = outcomes
        .iter()
        .filter(|o| matches!(o, TickOutcome::LinkFailed(_)))
        .count();
    assert_eq!(failures, 3);
    assert!(matches!(outcomes.last(), Some(TickOutcome::Frame { .. })));
    assert_eq!(h.status.consecutive_failures(), 0);

    let snap = h.diagnostics.snapshot();
    assert_eq!(snap.link_failures, 3);
    assert_eq!(snap.reconnects, 1);
    assert_eq!(snap.polls, 3);
}
