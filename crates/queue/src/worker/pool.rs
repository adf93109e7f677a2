//! Worker pool for job execution
//!
//! Runs a fixed number of workers against one shared queue, plus a repair loop
//! for backends with leases. Stop is cooperative: each worker finishes its
//! current job before exiting.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::PollerConfig;
use super::runner::{JobHandler, SharedWorkerState, Worker, WorkerState};
use crate::persistence::{JobQueue, QueueError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Consumer identity prefix; worker `i` claims as `<consumer_id>-<i>`
    pub consumer_id: String,

    /// Number of workers
    pub concurrency: usize,

    /// Lease granted on each claim
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Idle backoff for polling backends
    pub poller: PollerConfig,

    /// How often expired leases are repaired
    #[serde(with = "duration_millis")]
    pub repair_interval: Duration,

    /// Bound used by [`WorkerPool::shutdown`]
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("consumer-{}", Uuid::now_v7()),
            concurrency: 4,
            lease_duration: Duration::from_secs(300),
            poller: PollerConfig::default(),
            repair_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with `concurrency` workers
    pub fn new(concurrency: usize) -> Self {
        Self::default().with_concurrency(concurrency)
    }

    /// Set the consumer identity prefix
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the number of workers
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set repair interval
    pub fn with_repair_interval(mut self, interval: Duration) -> Self {
        self.repair_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Workers are running and claiming jobs
    Running,
    /// Stop was requested; workers finish their current job
    Draining,
    /// No worker is running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool already started
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Workers did not stop in time
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

struct WorkerSlot {
    consumer_id: String,
    state: SharedWorkerState,
}

/// Fixed-size pool of workers
///
/// # Example
///
/// ```ignore
/// use collector_queue::{handler_fn, InMemoryJobQueue, WorkerPool, WorkerPoolConfig};
///
/// let queue = Arc::new(InMemoryJobQueue::new());
/// let pool = WorkerPool::new(queue, WorkerPoolConfig::new(4), handler_fn(|payload| async move {
///     println!("{payload:?}");
///     Ok(())
/// }));
///
/// pool.start()?;
/// // ... later
/// pool.stop();
/// pool.join(Some(Duration::from_secs(30))).await?;
/// ```
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    config: WorkerPoolConfig,
    handler: JobHandler,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    workers: Mutex<Vec<WorkerSlot>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(queue: Arc<dyn JobQueue>, config: WorkerPoolConfig, handler: JobHandler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            queue,
            config,
            handler,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            workers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launch all workers and the repair loop
    #[instrument(skip(self), fields(consumer_id = %self.config.consumer_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            consumer_id = %self.config.consumer_id,
            concurrency = self.config.concurrency,
            lease_secs = self.config.lease_duration.as_secs(),
            "Starting worker pool"
        );

        self.shutdown_tx.send_replace(false);

        let mut slots = Vec::with_capacity(self.config.concurrency);
        let mut handles = Vec::with_capacity(self.config.concurrency + 1);

        for index in 0..self.config.concurrency {
            let worker = Worker::new(
                format!("{}-{}", self.config.consumer_id, index),
                Arc::clone(&self.queue),
                Arc::clone(&self.handler),
                self.config.lease_duration,
                self.config.poller.clone(),
                self.shutdown_tx.subscribe(),
            );
            slots.push(WorkerSlot {
                consumer_id: worker.consumer_id().to_string(),
                state: worker.state(),
            });
            handles.push(tokio::spawn(worker.run()));
        }

        if self.queue.supports_leases() {
            handles.push(self.spawn_repair_loop());
        }

        *self.workers.lock() = slots;
        *self.handles.lock() = handles;
        Ok(())
    }

    /// Ask every worker to stop after its current job. Does not wait.
    pub fn stop(&self) {
        let mut status = self.status.write();
        if *status == WorkerPoolStatus::Running {
            info!(consumer_id = %self.config.consumer_id, "Stopping worker pool");
            *status = WorkerPoolStatus::Draining;
        }
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until every worker has stopped, or until `timeout` elapses
    #[instrument(skip(self), fields(consumer_id = %self.config.consumer_id))]
    pub async fn join(&self, timeout: Option<Duration>) -> Result<(), WorkerPoolError> {
        let mut handles = std::mem::take(&mut *self.handles.lock());

        let joined = {
            let all = join_all(handles.iter_mut());
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, all).await.ok(),
                None => Some(all.await),
            }
        };

        match joined {
            Some(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Worker task ended abnormally: {}", e);
                    }
                }
                *self.status.write() = WorkerPoolStatus::Stopped;
                info!(consumer_id = %self.config.consumer_id, "Worker pool stopped");
                Ok(())
            }
            None => {
                handles.retain(|handle| !handle.is_finished());
                warn!(remaining = handles.len(), "Shutdown timeout reached");
                self.handles.lock().extend(handles);
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }

    /// Stop and join within the configured shutdown timeout
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        self.stop();
        self.join(Some(self.config.shutdown_timeout)).await
    }

    /// True while at least one worker has not stopped
    pub fn is_alive(&self) -> bool {
        self.workers
            .lock()
            .iter()
            .any(|slot| slot.state.get() != WorkerState::Stopped)
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Snapshot of each worker's consumer id and state
    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.workers
            .lock()
            .iter()
            .map(|slot| (slot.consumer_id.clone(), slot.state.get()))
            .collect()
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Start the expired lease repair loop
    fn spawn_repair_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.repair_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.repair().await {
                            Ok(repaired) => {
                                if !repaired.is_empty() {
                                    info!(count = repaired.len(), "Repaired expired leases");
                                }
                            }
                            Err(e) => {
                                error!("Lease repair failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Repair loop: shutdown requested");
                            break;
                        }
                    }
                }
            }

            debug!("Repair loop exited");
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
