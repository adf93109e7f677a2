//! Best-effort FIFO list backend
//!
//! A volatile list with push and blocking pop. No identifiers, attempt tracking
//! or repair: a job popped by a worker that then crashes is lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::store::*;

/// Volatile FIFO job list
///
/// Items are appended at the tail and popped from the head. `push_front` puts
/// an item at the head so it is popped next.
pub struct FifoJobQueue {
    items: Mutex<VecDeque<Payload>>,
    available: Notify,
    pop_timeout: Duration,
    closed: AtomicBool,
}

impl FifoJobQueue {
    /// Create a list whose `claim` blocks up to `pop_timeout`
    pub fn new(pop_timeout: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            pop_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Bound on how long `claim` waits for an item
    pub fn pop_timeout(&self) -> Duration {
        self.pop_timeout
    }

    /// Append an item at the tail. Returns the new length.
    pub fn push(&self, payload: Payload) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_back(payload);
            items.len()
        };
        self.available.notify_one();
        len
    }

    /// Insert an item at the head. Returns the new length.
    pub fn push_front(&self, payload: Payload) -> usize {
        let len = {
            let mut items = self.items.lock();
            items.push_front(payload);
            items.len()
        };
        self.available.notify_one();
        len
    }

    /// Append many items at the tail. Returns the new length.
    pub fn push_many(&self, payloads: impl IntoIterator<Item = Payload>) -> usize {
        let (len, added) = {
            let mut items = self.items.lock();
            let before = items.len();
            items.extend(payloads);
            (items.len(), items.len() - before)
        };
        for _ in 0..added {
            self.available.notify_one();
        }
        len
    }

    /// Remove and return the head item without waiting
    pub fn pop_now(&self) -> Option<Payload> {
        self.items.lock().pop_front()
    }

    /// Remove and return the head item, waiting up to `timeout` for one
    pub async fn pop_blocking(&self, timeout: Duration) -> Option<Payload> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent push is not missed
            notified.as_mut().enable();

            if let Some(payload) = self.pop_now() {
                return Some(payload);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop_now();
            }
        }
    }

    /// Remove every item
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for FifoJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl JobQueue for FifoJobQueue {
    async fn enqueue(&self, payload: Payload) -> Result<JobRef, QueueError> {
        if self.is_closed() {
            return Err(QueueError::BackendUnavailable("queue is closed".into()));
        }
        Ok(JobRef::Position(self.push(payload)))
    }

    async fn claim(
        &self,
        consumer_id: &str,
        _lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::BackendUnavailable("queue is closed".into()));
        }

        Ok(self.pop_blocking(self.pop_timeout).await.map(|payload| {
            let mut job = Job::pending(None, payload);
            job.state = JobState::Leased;
            job.lease_owner = Some(consumer_id.to_string());
            job
        }))
    }

    async fn complete(&self, _job: &Job) -> Result<(), QueueError> {
        Ok(())
    }

    async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        warn!(
            consumer_id = job.lease_owner.as_deref().unwrap_or("-"),
            error = message,
            "dropping failed job from best-effort queue"
        );
        Ok(FailOutcome::Dropped)
    }

    async fn repair(&self) -> Result<Vec<JobId>, QueueError> {
        Ok(vec![])
    }

    async fn size(&self) -> Result<usize, QueueError> {
        Ok(self.len())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(remaining = self.len(), "closing FIFO queue");
            self.available.notify_waiters();
        }
        Ok(())
    }

    fn idle_strategy(&self) -> IdleStrategy {
        IdleStrategy::Blocking
    }

    fn supports_leases(&self) -> bool {
        false
    }
}
