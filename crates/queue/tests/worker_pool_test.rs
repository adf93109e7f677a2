//! Worker pool scenarios against the in-memory and FIFO backends
//!
//! Run with: cargo test -p collector-queue --test worker_pool_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use collector_queue::prelude::*;
use collector_queue::LEASE_EXPIRED_MESSAGE;

fn device(hostname: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("hostname".to_string(), json!(hostname));
    payload.insert("community".to_string(), json!("public"));
    payload.insert("oids".to_string(), json!(["1.3.6.1.2.1.1.3.0"]));
    payload
}

fn fast_config(concurrency: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::new(concurrency)
        .with_consumer_id("test")
        .with_poller(
            PollerConfig::new()
                .with_min_interval(Duration::from_millis(5))
                .with_max_interval(Duration::from_millis(25)),
        )
        .with_repair_interval(Duration::from_millis(20))
}

fn counting_handler(counter: Arc<AtomicUsize>) -> JobHandler {
    handler_fn(move |_payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================
// In-memory lease backend
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_two_jobs_two_workers_drain() {
    let queue = Arc::new(InMemoryJobQueue::with_policy(RetryPolicy::no_retry()));
    let a = queue.enqueue(device("a")).await.unwrap().id().unwrap();
    let b = queue.enqueue(device("b")).await.unwrap().id().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(queue.clone(), fast_config(2), counting_handler(runs.clone()));
    pool.start().unwrap();

    wait_until(|| runs.load(Ordering::SeqCst) == 2).await;
    wait_until(|| queue.count_in_state(JobState::Completed) == 2).await;

    pool.stop();
    pool.join(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.state_of(a), Some(JobState::Completed));
    assert_eq!(queue.state_of(b), Some(JobState::Completed));
}

#[test_log::test(tokio::test)]
async fn test_failing_handler_marks_failed_and_worker_survives() {
    let queue = Arc::new(InMemoryJobQueue::with_policy(RetryPolicy::no_retry()));
    let first = queue.enqueue(device("down")).await.unwrap().id().unwrap();

    let handler = handler_fn(|payload| async move {
        let host = payload["hostname"].as_str().unwrap_or_default().to_string();
        if host == "down" {
            anyhow::bail!("device {host} unreachable");
        }
        Ok(())
    });

    let pool = WorkerPool::new(queue.clone(), fast_config(1), handler);
    pool.start().unwrap();

    wait_until(|| queue.state_of(first) == Some(JobState::Failed)).await;
    let job = queue.get(first).await.unwrap().unwrap();
    assert_eq!(job.last_error.as_deref(), Some("device down unreachable"));
    assert_eq!(job.attempts, 1);

    // Same worker keeps processing
    assert!(pool.is_alive());
    let second = queue.enqueue(device("up")).await.unwrap().id().unwrap();
    wait_until(|| queue.state_of(second) == Some(JobState::Completed)).await;

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_panicking_handler_is_isolated() {
    let queue = Arc::new(InMemoryJobQueue::with_policy(RetryPolicy::no_retry()));
    let ids = [
        queue.enqueue(device("boom")).await.unwrap().id().unwrap(),
        queue.enqueue(device("boom")).await.unwrap().id().unwrap(),
    ];

    let handler = handler_fn(|payload| async move {
        if payload.contains_key("hostname") {
            panic!("bad payload");
        }
        Ok(())
    });

    let pool = WorkerPool::new(queue.clone(), fast_config(1), handler);
    pool.start().unwrap();

    wait_until(|| queue.count_in_state(JobState::Failed) == 2).await;
    assert!(pool.is_alive());

    for id in ids {
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(
            job.last_error.as_deref(),
            Some("work function panicked: bad payload")
        );
    }

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_failed_job_is_retried_until_success() {
    let queue = Arc::new(InMemoryJobQueue::with_policy(RetryPolicy::fixed(
        Duration::from_millis(10),
        3,
    )));
    let job_id = queue.enqueue(device("flaky")).await.unwrap().id().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |_payload| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("timeout");
                }
                Ok(())
            }
        })
    };

    let pool = WorkerPool::new(queue.clone(), fast_config(2), handler);
    pool.start().unwrap();

    wait_until(|| queue.state_of(job_id) == Some(JobState::Completed)).await;
    pool.shutdown().await.unwrap();

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn test_expired_lease_is_repaired_by_pool() {
    let queue = Arc::new(InMemoryJobQueue::with_policy(
        RetryPolicy::fixed(Duration::ZERO, 2),
    ));
    let job_id = queue.enqueue(device("slow")).await.unwrap().id().unwrap();

    let handler = handler_fn(|_payload| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    });

    let config = fast_config(1).with_lease_duration(Duration::from_millis(50));
    let pool = WorkerPool::new(queue.clone(), config, handler);
    pool.start().unwrap();

    // attempts: 1 on claim, 2 on repair, which reaches the bound
    wait_until(|| queue.state_of(job_id) == Some(JobState::Failed)).await;
    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_MESSAGE));

    // The late completion is rejected and the state stays terminal
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(queue.state_of(job_id), Some(JobState::Failed));

    pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_idle_workers_stop_within_wait_bound() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let pool = WorkerPool::new(
        queue,
        fast_config(8),
        handler_fn(|_payload| async { Ok(()) }),
    );
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    pool.stop();
    pool.join(Some(Duration::from_secs(2))).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!pool.is_alive());
    assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
}

#[test_log::test(tokio::test)]
async fn test_in_flight_job_finishes_after_stop() {
    let queue = Arc::new(InMemoryJobQueue::new());
    let job_id = queue.enqueue(device("busy")).await.unwrap().id().unwrap();

    let pool = WorkerPool::new(
        queue.clone(),
        fast_config(1),
        handler_fn(|_payload| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }),
    );
    pool.start().unwrap();

    wait_until(|| queue.state_of(job_id) == Some(JobState::Leased)).await;
    pool.stop();
    pool.join(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(queue.state_of(job_id), Some(JobState::Completed));
}

/// Lease backend whose first `outages` claims report the store as down
struct FlakyQueue {
    inner: Arc<InMemoryJobQueue>,
    outages: AtomicUsize,
    failed_claims: AtomicUsize,
}

impl FlakyQueue {
    fn new(inner: Arc<InMemoryJobQueue>, outages: usize) -> Self {
        Self {
            inner,
            outages: AtomicUsize::new(outages),
            failed_claims: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, payload: Payload) -> Result<JobRef, QueueError> {
        self.inner.enqueue(payload).await
    }

    async fn claim(&self, consumer_id: &str, lease: Duration) -> Result<Option<Job>, QueueError> {
        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            self.failed_claims.fetch_add(1, Ordering::SeqCst);
            return Err(QueueError::BackendUnavailable("connection refused".to_string()));
        }
        self.inner.claim(consumer_id, lease).await
    }

    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        self.inner.fail(job, message).await
    }

    async fn repair(&self) -> Result<Vec<JobId>, QueueError> {
        self.inner.repair().await
    }

    async fn size(&self) -> Result<usize, QueueError> {
        self.inner.size().await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.inner.get(job_id).await
    }
}

#[test_log::test(tokio::test)]
async fn test_worker_survives_unavailable_backend() {
    let inner = Arc::new(InMemoryJobQueue::with_policy(RetryPolicy::no_retry()));
    let job_id = inner.enqueue(device("r1")).await.unwrap().id().unwrap();
    let queue = Arc::new(FlakyQueue::new(inner.clone(), 3));

    let runs = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(queue.clone(), fast_config(1), counting_handler(runs.clone()));
    pool.start().unwrap();

    wait_until(|| inner.state_of(job_id) == Some(JobState::Completed)).await;

    assert_eq!(queue.failed_claims.load(Ordering::SeqCst), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(pool.is_alive());
    assert_eq!(inner.get(job_id).await.unwrap().unwrap().attempts, 1);

    pool.stop();
    pool.join(Some(Duration::from_secs(5))).await.unwrap();
    assert!(!pool.is_alive());
}

// ============================================
// FIFO backend
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_fifo_pool_drains_list() {
    let queue = Arc::new(FifoJobQueue::new(Duration::from_millis(20)));
    queue.push_many((0..10).map(|i| device(&format!("host-{i}"))));

    let runs = Arc::new(AtomicUsize::new(0));
    let pool = WorkerPool::new(queue.clone(), fast_config(3), counting_handler(runs.clone()));
    pool.start().unwrap();

    wait_until(|| runs.load(Ordering::SeqCst) == 10).await;
    assert_eq!(queue.size().await.unwrap(), 0);

    let start = Instant::now();
    pool.shutdown().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test_log::test(tokio::test)]
async fn test_fifo_failures_are_dropped() {
    let queue = Arc::new(FifoJobQueue::new(Duration::from_millis(20)));
    queue.push(device("a"));
    queue.push(device("b"));

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        handler_fn(move |_payload| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("no route to host")
            }
        })
    };

    let pool = WorkerPool::new(queue.clone(), fast_config(1), handler);
    pool.start().unwrap();

    wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
    pool.shutdown().await.unwrap();

    // Nothing was put back
    assert!(queue.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================
// Statistics
// ============================================

#[test_log::test(tokio::test)]
async fn test_stats_on_empty_queue() {
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
    let mut reporter = StatisticsReporter::new(queue, Duration::from_millis(10));

    let first = reporter.sample().await.unwrap();
    let second = reporter.sample().await.unwrap();
    assert_eq!(first.to_string(), "Jobs left: 0, Performance: 0 jobs/sec");
    assert_eq!(second.to_string(), "Jobs left: 0, Performance: 0 jobs/sec");
}
