//! JobQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend-assigned job identifier
pub type JobId = Uuid;

/// Job payload: string keys to JSON values, opaque to the queue
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Storage connection is down or the backend has been closed
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Caller does not hold the current lease on the job
    #[error("job {0} is not leased by the caller")]
    NotLeased(JobId),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Job carries no identifier (best-effort backends)
    #[error("job has no identifier")]
    MissingJobId,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed
    Pending,

    /// Claimed by a consumer holding a lease
    Leased,

    /// Finished successfully
    Completed,

    /// Permanently failed
    Failed,
}

impl JobState {
    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::Serialization(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// Reference to an enqueued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRef {
    /// Identifier assigned by a lease backend
    Id(JobId),

    /// Queue length after the push (best-effort list backends)
    Position(usize),
}

impl JobRef {
    /// The job id, when the backend assigns one
    pub fn id(&self) -> Option<JobId> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Position(_) => None,
        }
    }
}

/// A job as seen by the queue and, transiently, by the worker holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Option<JobId>,
    pub payload: Payload,
    pub attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a fresh pending job
    pub fn pending(id: Option<JobId>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id,
            payload,
            attempts: 0,
            lease_owner: None,
            lease_expiry: None,
            state: JobState::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Short label for log records
    pub fn label(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    /// Whether the lease is still current at `now`
    pub fn lease_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Leased && self.lease_expiry.is_some_and(|expiry| expiry > now)
    }
}

/// Outcome of failing a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Job went back to pending and becomes claimable after `delay`
    Requeued { attempts: u32, delay: Duration },

    /// Job moved to the terminal failed state (requeue disabled)
    Failed,

    /// Job moved to the terminal failed state after exhausting its attempts
    AttemptsExceeded,

    /// Best-effort backend: the job is gone, the failure was only logged
    Dropped,
}

/// How a worker should behave when `claim` comes back empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// `claim` already waited for work; loop straight back
    Blocking,

    /// `claim` returns immediately; the worker backs off before retrying
    Poll,
}

/// Compute a lease deadline without overflowing
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Job queue backend
///
/// Implementations must be thread-safe: `claim` hands each job to at most one
/// caller and `complete`/`fail` perform at most one terminal transition per lease.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Append a new pending job
    async fn enqueue(&self, payload: Payload) -> Result<JobRef, QueueError>;

    /// Lease one eligible job to `consumer_id` for `lease`
    ///
    /// Increments the job's attempt count. Returns `None` when nothing is eligible.
    async fn claim(&self, consumer_id: &str, lease: Duration)
        -> Result<Option<Job>, QueueError>;

    /// Mark a leased job completed
    ///
    /// Fails with [`QueueError::NotLeased`] when `job` no longer carries the current lease.
    async fn complete(&self, job: &Job) -> Result<(), QueueError>;

    /// Report a failed execution of a leased job
    async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError>;

    /// Return jobs with expired leases to pending
    ///
    /// Returns the ids whose state changed. Idempotent.
    async fn repair(&self) -> Result<Vec<JobId>, QueueError>;

    /// Pending plus leased jobs. Stale under concurrency; observability only.
    async fn size(&self) -> Result<usize, QueueError>;

    /// Look up a job by id
    async fn get(&self, _job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(None)
    }

    /// Release the backend connection
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Idle behaviour expected from workers
    fn idle_strategy(&self) -> IdleStrategy {
        IdleStrategy::Poll
    }

    /// Whether the backend tracks leases (and so needs a repair loop)
    fn supports_leases(&self) -> bool {
        true
    }
}
