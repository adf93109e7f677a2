//! In-memory implementation of JobQueue with full lease semantics

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::reliability::RetryPolicy;

/// Message recorded on jobs failed by repair
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired";

/// Internal job state
struct JobRecord {
    job: Job,
    seq: u64,
    visible_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

/// In-memory lease-capable job queue
///
/// All state lives behind one lock, so `claim`, `complete`, `fail` and `repair`
/// are atomic with respect to each other. Pending jobs are claimed in insertion
/// order; repaired and requeued jobs keep their original position.
///
/// # Example
///
/// ```
/// use collector_queue::{InMemoryJobQueue, RetryPolicy};
///
/// let queue = InMemoryJobQueue::with_policy(RetryPolicy::no_retry());
/// assert_eq!(queue.max_attempts(), 1);
/// ```
pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    policy: RetryPolicy,
}

impl InMemoryJobQueue {
    /// Create a new in-memory queue with the default retry policy
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Create a new in-memory queue with the given retry policy
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
        }
    }

    /// Configured attempt bound
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Current state of a job
    pub fn state_of(&self, job_id: JobId) -> Option<JobState> {
        self.inner.lock().records.get(&job_id).map(|r| r.job.state)
    }

    /// Number of jobs in the given state
    pub fn count_in_state(&self, state: JobState) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| r.job.state == state)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.next_seq = 0;
    }

    /// Find the record a lease-holder refers to, checking the lease is still current
    fn leased_record<'a>(
        inner: &'a mut Inner,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<&'a mut JobRecord, QueueError> {
        let job_id = job.id.ok_or(QueueError::MissingJobId)?;
        let record = inner
            .records
            .get_mut(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        let holds_lease = record.job.lease_valid_at(now)
            && record.job.lease_owner == job.lease_owner
            && record.job.attempts == job.attempts;

        if holds_lease {
            Ok(record)
        } else {
            Err(QueueError::NotLeased(job_id))
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn release(job: &mut Job, state: JobState, now: DateTime<Utc>) {
    job.state = state;
    job.lease_owner = None;
    job.lease_expiry = None;
    job.updated_at = now;
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    #[instrument(skip(self, payload))]
    async fn enqueue(&self, payload: Payload) -> Result<JobRef, QueueError> {
        let job_id = Uuid::now_v7();
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job = Job::pending(Some(job_id), payload);
        let visible_at = job.created_at;
        inner.records.insert(
            job_id,
            JobRecord {
                job,
                seq,
                visible_at,
            },
        );

        debug!(%job_id, "enqueued job");
        Ok(JobRef::Id(job_id))
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        consumer_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let max_attempts = self.policy.max_attempts;
        let mut inner = self.inner.lock();

        let Some(record) = inner
            .records
            .values_mut()
            .filter(|r| {
                r.job.state == JobState::Pending
                    && r.visible_at <= now
                    && r.job.attempts < max_attempts
            })
            .min_by_key(|r| r.seq)
        else {
            return Ok(None);
        };

        record.job.state = JobState::Leased;
        record.job.lease_owner = Some(consumer_id.to_string());
        record.job.lease_expiry = Some(deadline_after(now, lease));
        record.job.attempts += 1;
        record.job.updated_at = now;

        debug!(
            job_id = %record.job.label(),
            consumer_id,
            attempts = record.job.attempts,
            "claimed job"
        );
        Ok(Some(record.job.clone()))
    }

    #[instrument(skip(self, job), fields(job_id = %job.label()))]
    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = Self::leased_record(&mut inner, job, now)?;

        release(&mut record.job, JobState::Completed, now);
        debug!("completed job");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.label()))]
    async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = Self::leased_record(&mut inner, job, now)?;

        record.job.last_error = Some(message.to_string());
        let attempts = record.job.attempts;

        if self.policy.should_requeue(attempts) {
            let delay = self.policy.delay_for_attempt(attempts + 1);
            release(&mut record.job, JobState::Pending, now);
            record.visible_at = deadline_after(now, delay);

            debug!(attempts, ?delay, "job will retry");
            Ok(FailOutcome::Requeued { attempts, delay })
        } else {
            release(&mut record.job, JobState::Failed, now);

            if self.policy.requeue_on_fail {
                warn!(attempts, "job exhausted its attempts");
                Ok(FailOutcome::AttemptsExceeded)
            } else {
                debug!(attempts, "job failed");
                Ok(FailOutcome::Failed)
            }
        }
    }

    #[instrument(skip(self))]
    async fn repair(&self) -> Result<Vec<JobId>, QueueError> {
        let now = Utc::now();
        let max_attempts = self.policy.max_attempts;
        let mut inner = self.inner.lock();
        let mut repaired = vec![];

        for (job_id, record) in inner.records.iter_mut() {
            let expired = record.job.state == JobState::Leased
                && record.job.lease_expiry.is_some_and(|expiry| expiry <= now);
            if !expired {
                continue;
            }

            record.job.attempts += 1;
            if record.job.attempts >= max_attempts {
                record.job.last_error = Some(LEASE_EXPIRED_MESSAGE.to_string());
                release(&mut record.job, JobState::Failed, now);
            } else {
                release(&mut record.job, JobState::Pending, now);
                record.visible_at = now;
            }
            repaired.push(*job_id);
        }

        if !repaired.is_empty() {
            debug!(count = repaired.len(), "repaired expired leases");
        }
        Ok(repaired)
    }

    async fn size(&self) -> Result<usize, QueueError> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| !r.job.state.is_terminal())
            .count())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&job_id)
            .map(|r| r.job.clone()))
    }
}
