//! Reliability patterns for the job queue
//!
//! This module provides:
//! - [`RetryPolicy`] - Attempt bounds, requeue-on-fail and exponential backoff

mod retry;

pub use retry::RetryPolicy;
