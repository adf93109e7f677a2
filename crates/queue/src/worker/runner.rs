//! Single worker loop
//!
//! `Idle → Claiming → Executing → (Idle | Stopped)`. The stop signal is only
//! honoured at the top of a cycle or while idle, never during execution.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::poller::{Poller, PollerConfig};
use crate::persistence::{FailOutcome, IdleStrategy, Job, JobQueue, Payload, QueueError};

/// Work function: runs one job payload
pub type JobHandler = Arc<dyn Fn(Payload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| handler(payload).boxed())
}

/// Error raised while executing a job, caught at the worker boundary
#[derive(Debug, thiserror::Error)]
pub enum JobExecutionError {
    /// Work function returned an error
    #[error("{0}")]
    Failed(String),

    /// Work function panicked
    #[error("work function panicked: {0}")]
    Panicked(String),
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Claiming = 1,
    Executing = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Claiming,
            2 => Self::Executing,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Claiming => write!(f, "claiming"),
            Self::Executing => write!(f, "executing"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Worker state readable from other tasks
#[derive(Debug, Clone)]
pub struct SharedWorkerState(Arc<AtomicU8>);

impl SharedWorkerState {
    pub fn new(state: WorkerState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// One worker bound to a shared queue
pub struct Worker {
    consumer_id: String,
    queue: Arc<dyn JobQueue>,
    handler: JobHandler,
    lease_duration: Duration,
    poller: Poller,
    state: SharedWorkerState,
}

impl Worker {
    /// Create a new worker
    pub fn new(
        consumer_id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        handler: JobHandler,
        lease_duration: Duration,
        poller: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            queue,
            handler,
            lease_duration,
            poller: Poller::new(poller, shutdown_rx),
            state: SharedWorkerState::new(WorkerState::Idle),
        }
    }

    /// Consumer identity used for leases
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Handle to this worker's state
    pub fn state(&self) -> SharedWorkerState {
        self.state.clone()
    }

    /// Run until the stop signal is raised
    pub async fn run(mut self) {
        info!(consumer_id = %self.consumer_id, "Worker started");
        let idle_strategy = self.queue.idle_strategy();

        loop {
            if self.poller.is_shutdown() {
                break;
            }

            self.state.set(WorkerState::Claiming);
            let claimed = self
                .queue
                .claim(&self.consumer_id, self.lease_duration)
                .await;

            match claimed {
                Ok(Some(job)) => {
                    self.poller.reset_backoff();
                    self.state.set(WorkerState::Executing);
                    self.execute(job).await;
                    self.state.set(WorkerState::Idle);
                }
                Ok(None) => {
                    self.state.set(WorkerState::Idle);
                    if idle_strategy == IdleStrategy::Poll && self.poller.wait().await {
                        break;
                    }
                }
                Err(e) => {
                    self.state.set(WorkerState::Idle);
                    warn!(consumer_id = %self.consumer_id, error = %e, "Failed to claim job");
                    if self.poller.wait().await {
                        break;
                    }
                }
            }
        }

        self.state.set(WorkerState::Stopped);
        info!(consumer_id = %self.consumer_id, "Worker stopped");
    }

    /// Execute one job and report the result
    async fn execute(&self, job: Job) {
        let job_id = job.label();
        info!(consumer_id = %self.consumer_id, %job_id, attempts = job.attempts, "Job started");

        match self.invoke(job.payload.clone()).await {
            Ok(()) => match self.queue.complete(&job).await {
                Ok(()) => info!(consumer_id = %self.consumer_id, %job_id, "Job completed"),
                Err(QueueError::NotLeased(_)) => warn!(
                    consumer_id = %self.consumer_id,
                    %job_id,
                    "Lease lost before completion, dropping result"
                ),
                Err(e) => error!(%job_id, "Failed to complete job: {}", e),
            },
            Err(err) => {
                warn!(consumer_id = %self.consumer_id, %job_id, error = %err, "Job ended with an error");
                match self.queue.fail(&job, &err.to_string()).await {
                    Ok(FailOutcome::Requeued { attempts, delay }) => {
                        debug!(%job_id, attempts, ?delay, "Job requeued")
                    }
                    Ok(FailOutcome::AttemptsExceeded) => {
                        warn!(%job_id, attempts = job.attempts, "Job exhausted its attempts")
                    }
                    Ok(FailOutcome::Failed | FailOutcome::Dropped) => {}
                    Err(QueueError::NotLeased(_)) => warn!(
                        consumer_id = %self.consumer_id,
                        %job_id,
                        "Lease lost before failure was recorded"
                    ),
                    Err(e) => error!(%job_id, "Failed to fail job: {}", e),
                }
            }
        }
    }

    /// Run the work function, turning errors and panics into [`JobExecutionError`]
    async fn invoke(&self, payload: Payload) -> Result<(), JobExecutionError> {
        let handler = Arc::clone(&self.handler);
        let outcome = AssertUnwindSafe(async move { handler(payload).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobExecutionError::Failed(format!("{e:#}"))),
            Err(panic) => Err(JobExecutionError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
