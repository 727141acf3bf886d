//! Work queue for reconcile keys.
//!
//! Workers pop stream keys and reconcile them; producers add keys
//! immediately (watch events) or after a delay (retry backoff). Delayed
//! re-enqueue is the controller's only scheduling mechanism: orchestrators
//! compute delays, they never sleep.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::release::StreamKey;

/// The delayed-enqueue protocol exposed to the orchestrators.
///
/// A zero delay means "do not re-enqueue"; the orchestrators only hand
/// over positive delays.
pub trait RetryQueue: Send + Sync {
    /// Enqueue `key` for processing after `delay`.
    fn add_after(&self, key: StreamKey, delay: Duration);
}

#[derive(Debug, Eq, PartialEq)]
struct DelayedEntry {
    at: Instant,
    key: StreamKey,
}

// BinaryHeap is a max-heap; order reversed so the earliest deadline wins.
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at).then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StreamKey>,
    // Keys currently in `ready`; duplicate adds collapse into one entry.
    pending: HashSet<StreamKey>,
    delayed: BinaryHeap<DelayedEntry>,
}

/// A deduplicating work queue with delayed re-enqueue.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key for immediate processing.
    pub fn add(&self, key: StreamKey) {
        {
            let mut state = self.state.lock().expect("work queue lock poisoned");
            if state.pending.insert(key.clone()) {
                state.ready.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Pop the next ready key, waiting for one to become due.
    pub async fn next(&self) -> StreamKey {
        loop {
            let deadline = {
                let mut state = self.state.lock().expect("work queue lock poisoned");
                let now = Instant::now();
                while state
                    .delayed
                    .peek()
                    .map(|entry| entry.at <= now)
                    .unwrap_or(false)
                {
                    let entry = state.delayed.pop().expect("peeked entry exists");
                    if state.pending.insert(entry.key.clone()) {
                        state.ready.push_back(entry.key);
                    }
                }
                if let Some(key) = state.ready.pop_front() {
                    state.pending.remove(&key);
                    if !state.ready.is_empty() {
                        // More work exists; wake a sibling worker.
                        self.notify.notify_one();
                    }
                    return key;
                }
                state.delayed.peek().map(|entry| entry.at)
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Number of keys currently ready or scheduled.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("work queue lock poisoned");
        state.ready.len() + state.delayed.len()
    }

    /// True when nothing is ready or scheduled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RetryQueue for WorkQueue {
    fn add_after(&self, key: StreamKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.state.lock().expect("work queue lock poisoned");
            state.delayed.push(DelayedEntry {
                at: Instant::now() + delay,
                key,
            });
        }
        // Wake a sleeping worker so it recomputes its deadline.
        self.notify.notify_one();
    }
}
