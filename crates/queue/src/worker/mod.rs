//! Workers and the pool that runs them
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed-size set of workers sharing one queue, plus lease repair
//! - [`Worker`] - Single claim/execute/report loop with panic isolation
//! - [`PollerConfig`] - Idle backoff for polling backends
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     WorkerPool                        │
//! │  [Worker 0] [Worker 1] ... [Worker N-1]  [Repairer]   │
//! │      │          │              │              │       │
//! │      └──────────┴──────┬───────┴──────────────┘       │
//! │                        ▼                              │
//! │               Arc<dyn JobQueue>                       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use collector_queue::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new(8)
//!     .with_consumer_id("collector-a")
//!     .with_lease_duration(Duration::from_secs(60));
//!
//! let pool = WorkerPool::new(queue, config, handler_fn(poll_device));
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;
mod runner;

pub use poller::{Poller, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use runner::{handler_fn, JobExecutionError, JobHandler, SharedWorkerState, Worker, WorkerState};
