//! Bounded hand-off between the poller and the pipeline workers.
//!
//! The poller must never block on a slow consumer, so [`CycleQueue::push`] is
//! synchronous and applies an explicit [`OverflowPolicy`] when the queue is full.
//! Workers wait on [`CycleQueue::pop`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::cycle_fsm::CycleWindow;

/// What to drop when a window arrives at a full queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued window to make room
    #[default]
    DropOldest,
    /// Refuse the arriving window
    DropNewest,
}

/// Result of a push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Queued with room to spare
    Queued,
    /// Queued after evicting this window
    Evicted(Arc<CycleWindow>),
    /// Not queued: full under `DropNewest`
    Rejected(Arc<CycleWindow>),
    /// Not queued: the queue is closed for shutdown
    Closed(Arc<CycleWindow>),
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<CycleWindow>>,
    closed: bool,
}

/// Multi-consumer bounded FIFO of completed windows
#[derive(Debug)]
pub struct CycleQueue {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CycleQueue {
    /// Queue holding at most `capacity` windows (at least one)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Maximum number of queued windows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Windows waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True when no window is waiting
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Enqueue without waiting
    pub fn push(&self, window: Arc<CycleWindow>) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed(window);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(window);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => return PushOutcome::Rejected(window),
                    OverflowPolicy::DropOldest => {
                        let evicted = state.items.pop_front();
                        state.items.push_back(window);
                        match evicted {
                            Some(old) => PushOutcome::Evicted(old),
                            None => PushOutcome::Queued,
                        }
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next window. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Arc<CycleWindow>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(window) = state.items.pop_front() {
                    return Some(window);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting windows and wake every waiting worker.
    ///
    /// Windows already queued are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// True once [`CycleQueue::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
