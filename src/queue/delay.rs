//! Jobs waiting for a due time, and the promoter that releases them.
//!
//! Retries and deferred submissions park here instead of occupying a
//! worker. A single [`Promoter`] task sleeps until the earliest due time,
//! flips due jobs back to `Ready` through the tracker and appends them to
//! the [`ReadyQueue`].

use chrono::{DateTime, Utc};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::ready::ReadyQueue;
use crate::core::job::{Job, JobUpdate};
use crate::tracker::StatusTracker;

/// Heap entry ordered by due time, then insertion order.
struct Delayed {
    due: DateTime<Utc>,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Min-heap of jobs keyed by the time they become runnable.
pub struct DelayQueue {
    heap: Mutex<BinaryHeap<Reverse<Delayed>>>,
    seq: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl DelayQueue {
    /// Create an empty delay queue.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Park `job` until `at`.
    pub fn schedule(&self, job: Job, at: DateTime<Utc>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Reverse(Delayed { due: at, seq, job }));
        // The new entry may be earlier than what the promoter sleeps on.
        self.notify.notify_one();
    }

    /// Remove every job due at or before `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut heap = self.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry.job);
            }
        }
        due
    }

    /// The earliest due time, if any job is waiting.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().peek().map(|Reverse(entry)| entry.due)
    }

    /// Number of parked jobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop the promoter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<Delayed>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task moving due jobs from the delay queue to the ready queue.
pub struct Promoter {
    delayed: Arc<DelayQueue>,
    ready: Arc<ReadyQueue>,
    tracker: Arc<dyn StatusTracker>,
}

impl Promoter {
    pub fn new(
        delayed: Arc<DelayQueue>,
        ready: Arc<ReadyQueue>,
        tracker: Arc<dyn StatusTracker>,
    ) -> Self {
        Self {
            delayed,
            ready,
            tracker,
        }
    }

    /// Spawn the promoter loop on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the delay queue is closed.
    pub async fn run(self) {
        tracing::debug!("Promoter started");
        loop {
            let notified = self.delayed.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.delayed.is_closed() {
                break;
            }

            self.promote_due(Utc::now()).await;

            match self.delayed.next_due() {
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
        tracing::debug!(parked = self.delayed.len(), "Promoter stopped");
    }

    /// Release every job due at `now`. Returns the number promoted.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        for job in self.delayed.take_due(now) {
            let id = job.id();
            match self.tracker.update(&id, JobUpdate::ready()).await {
                Ok(snapshot) => {
                    tracing::debug!(job_id = %id, attempt = snapshot.attempt(), "Promoted delayed job");
                    self.ready.enqueue(snapshot);
                    promoted += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Failed to promote delayed job, dropping it");
                }
            }
        }
        promoted
    }
}
