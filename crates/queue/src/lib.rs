//! # Collector Job Queue
//!
//! A lease-based job queue consumed by a pool of concurrent workers.
//!
//! ## Features
//!
//! - **Leases**: a claimed job belongs to one consumer until it completes, fails
//!   or its lease expires
//! - **Repair**: abandoned leases return to the queue (or fail once attempts run out)
//! - **Retries**: configurable requeue-on-fail with exponential backoff and jitter
//! - **Backends**: in-memory, PostgreSQL (`FOR UPDATE SKIP LOCKED`), volatile FIFO list
//! - **Cooperative shutdown**: workers finish their current job, then exit
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (N workers claim → run handler → complete/fail; repairer)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobQueue                             │
//! │        (InMemoryJobQueue | PostgresJobQueue | FifoJobQueue)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ size()
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StatisticsReporter                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use collector_queue::prelude::*;
//!
//! let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
//! let pool = WorkerPool::new(
//!     queue.clone(),
//!     WorkerPoolConfig::new(4),
//!     handler_fn(|payload| async move {
//!         tracing::info!(?payload, "working");
//!         Ok(())
//!     }),
//! );
//!
//! pool.start()?;
//! let mut stats = StatisticsReporter::new(queue.clone(), Duration::from_secs(1));
//! println!("{}", stats.sample().await?);
//! pool.shutdown().await?;
//! queue.close().await?;
//! ```

pub mod persistence;
pub mod reliability;
pub mod stats;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::persistence::{
        FailOutcome, FifoJobQueue, IdleStrategy, InMemoryJobQueue, Job, JobId, JobQueue, JobRef,
        JobState, Payload, PostgresJobQueue, QueueError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::stats::{StatisticsReporter, Stats};
    pub use crate::worker::{
        handler_fn, JobHandler, PollerConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError,
        WorkerPoolStatus, WorkerState,
    };
}

// Re-export key types at crate root
pub use persistence::{
    FailOutcome, FifoJobQueue, IdleStrategy, InMemoryJobQueue, Job, JobId, JobQueue, JobRef,
    JobState, Payload, PostgresJobQueue, QueueError, LEASE_EXPIRED_MESSAGE,
};
pub use reliability::RetryPolicy;
pub use stats::{StatisticsReporter, Stats};
pub use worker::{
    handler_fn, JobExecutionError, JobHandler, PollerConfig, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolStatus, WorkerState,
};
