//! Service wiring, signal handling and orderly shutdown

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use collector_queue::{
    FifoJobQueue, InMemoryJobQueue, JobHandler, JobQueue, PostgresJobQueue, QueueError,
    StatisticsReporter, WorkerPool, WorkerPoolConfig, WorkerPoolError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{BackendKind, ServiceConfig};
use crate::poll::DeviceJob;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Pool(#[from] WorkerPoolError),

    #[error("failed to close queue: {0}")]
    Close(#[from] QueueError),
}

/// Owns the queue, the worker pool and the statistics loop
pub struct Supervisor {
    queue: Arc<dyn JobQueue>,
    pool: WorkerPool,
    stats: StatisticsReporter,
    shutdown_timeout: Duration,
    token: CancellationToken,
    shut_down: AtomicBool,
}

impl Supervisor {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pool_config: WorkerPoolConfig,
        handler: JobHandler,
        stats_interval: Duration,
    ) -> Self {
        let shutdown_timeout = pool_config.shutdown_timeout;
        Self {
            pool: WorkerPool::new(Arc::clone(&queue), pool_config, handler),
            stats: StatisticsReporter::new(Arc::clone(&queue), stats_interval),
            queue,
            shutdown_timeout,
            token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Token that ends [`Supervisor::run`] when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start the pool and report statistics until cancelled, then shut down
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        self.pool.start()?;
        info!(
            workers = self.pool.config().concurrency,
            "Collector running, waiting for jobs"
        );

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                sample = self.stats.sample() => match sample {
                    Ok(stats) => info!("{}", stats),
                    Err(e) => {
                        warn!(error = %e, "Failed to sample queue size");
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.stats.interval()) => {}
                        }
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Stop and join the pool, then close the queue. Runs at most once.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Shutting down");
        self.pool.stop();
        let joined = self.pool.join(Some(self.shutdown_timeout)).await;
        if let Err(e) = &joined {
            error!(error = %e, "Workers did not stop cleanly");
        }

        self.queue.close().await?;
        joined?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async move {
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        watch_signals(tokio::signal::ctrl_c(), terminate, token).await;
    }))
}

/// Wait for an interrupt or terminate signal, then cancel `token`.
/// A failed interrupt listener leaves the terminate listener in place.
async fn watch_signals<I, T>(interrupt: I, terminate: T, token: CancellationToken)
where
    I: Future<Output = std::io::Result<()>>,
    T: Future<Output = ()>,
{
    tokio::pin!(terminate);

    tokio::select! {
        result = interrupt => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!(error = %e, "Failed to listen for Ctrl+C, waiting for SIGTERM only");
                tokio::select! {
                    _ = &mut terminate => info!("Received SIGTERM"),
                    _ = token.cancelled() => return,
                }
            }
        },
        _ = &mut terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

/// Build the queue backend named in the configuration
pub async fn connect_queue(config: &ServiceConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    let queue: Arc<dyn JobQueue> = match config.backend {
        BackendKind::Memory => Arc::new(InMemoryJobQueue::with_policy(config.retry_policy())),
        BackendKind::Fifo => Arc::new(FifoJobQueue::new(config.pop_timeout)),
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for the postgres backend")?;
            let queue = PostgresJobQueue::connect(url, config.retry_policy())
                .await
                .context("Failed to connect to job database")?;
            queue.migrate().await.context("Failed to migrate job database")?;
            Arc::new(queue)
        }
    };

    info!(backend = ?config.backend, "Queue backend ready");
    Ok(queue)
}

/// Enqueue every device job listed in a JSON array file
pub async fn seed_jobs(queue: &dyn JobQueue, path: &Path) -> anyhow::Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let jobs: Vec<DeviceJob> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse jobs in {}", path.display()))?;

    let count = jobs.len();
    for job in jobs {
        queue.enqueue(job.into_payload()?).await?;
    }

    info!(count, path = %path.display(), "Seeded jobs");
    Ok(count)
}
