//! FIFO queue of jobs ready for immediate execution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use crate::core::job::Job;

/// Multi-producer, multi-consumer FIFO of ready jobs.
///
/// Each job is popped under the queue mutex, so exactly one consumer
/// receives it. Consumers suspend on a [`Notify`] while the queue is empty.
pub struct ReadyQueue {
    jobs: Mutex<VecDeque<Job>>,
    notify: Notify,
    closed: AtomicBool,
}

impl ReadyQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a job at the tail and wake one waiting consumer.
    pub fn enqueue(&self, job: Job) {
        self.lock().push_back(job);
        self.notify.notify_one();
    }

    /// Remove the job at the head, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed, even if jobs remain.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close or enqueue that races with
            // the check still wakes us.
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(job) = self.try_dequeue() {
                return Some(job);
            }

            notified.await;
        }
    }

    /// Remove the job at the head without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    /// Stop handing out jobs and wake every waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return every queued job.
    pub fn drain(&self) -> Vec<Job> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        // A panic while holding this lock cannot leave the deque half-written.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
