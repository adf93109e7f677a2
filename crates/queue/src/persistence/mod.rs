//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobQueue`] trait shared by every backend
//! - [`InMemoryJobQueue`] lease backend for tests and single-process runs
//! - [`PostgresJobQueue`] durable lease backend
//! - [`FifoJobQueue`] best-effort volatile list

mod fifo;
mod memory;
mod postgres;
mod store;

pub use fifo::FifoJobQueue;
pub use memory::{InMemoryJobQueue, LEASE_EXPIRED_MESSAGE};
pub use postgres::PostgresJobQueue;
pub use store::{
    FailOutcome, IdleStrategy, Job, JobId, JobQueue, JobRef, JobState, Payload, QueueError,
};
