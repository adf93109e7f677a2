//! PostgreSQL implementation of JobQueue
//!
//! Durable lease backend using:
//! - `FOR UPDATE SKIP LOCKED` for contention-free claiming
//! - Guarded single-statement updates for complete/fail/repair, so each lease
//!   gets at most one terminal transition

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::memory::LEASE_EXPIRED_MESSAGE;
use super::store::*;
use crate::reliability::RetryPolicy;

const JOB_COLUMNS: &str = "id, payload, state, attempts, lease_owner, lease_expiry, \
                           last_error, created_at, updated_at";

/// PostgreSQL implementation of JobQueue
///
/// # Example
///
/// ```ignore
/// use collector_queue::{PostgresJobQueue, RetryPolicy};
///
/// let queue = PostgresJobQueue::connect("postgres://localhost/collector", RetryPolicy::default()).await?;
/// queue.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PostgresJobQueue {
    /// Create a queue over an existing connection pool
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Connect to the database at `url`
    pub async fn connect(url: &str, policy: RetryPolicy) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| {
                error!("Failed to connect to job database: {}", e);
                unavailable(e)
            })?;
        Ok(Self::new(pool, policy))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::BackendUnavailable(format!("migration failed: {e}")))?;
        info!("Job queue schema is up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a missing job from a lost lease after a guarded update matched nothing
    async fn lease_error(&self, job_id: JobId) -> QueueError {
        let exists = sqlx::query("SELECT 1 FROM collector_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await;

        match exists {
            Ok(Some(_)) => QueueError::NotLeased(job_id),
            Ok(None) => QueueError::JobNotFound(job_id),
            Err(e) => unavailable(e),
        }
    }
}

fn unavailable(e: sqlx::Error) -> QueueError {
    QueueError::BackendUnavailable(e.to_string())
}

/// `attempts` is an INTEGER column
fn attempts_bound(max_attempts: u32) -> Result<i32, QueueError> {
    i32::try_from(max_attempts).map_err(|_| {
        QueueError::Serialization(format!("max_attempts {max_attempts} exceeds the column range"))
    })
}

fn row_to_job(row: &PgRow) -> Result<Job, QueueError> {
    let payload = match row.get::<serde_json::Value, _>("payload") {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(QueueError::Serialization(format!(
                "job payload is not an object: {other}"
            )))
        }
    };
    let state: String = row.get("state");

    Ok(Job {
        id: Some(row.get("id")),
        payload,
        attempts: row.get::<i32, _>("attempts") as u32,
        lease_owner: row.get("lease_owner"),
        lease_expiry: row.get("lease_expiry"),
        state: state.parse()?,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, payload))]
    async fn enqueue(&self, payload: Payload) -> Result<JobRef, QueueError> {
        let job_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO collector_jobs (id, payload, state, attempts)
            VALUES ($1, $2, 'pending', 0)
            "#,
        )
        .bind(job_id)
        .bind(serde_json::Value::Object(payload))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue job: {}", e);
            unavailable(e)
        })?;

        debug!(%job_id, "enqueued job");
        Ok(JobRef::Id(job_id))
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        consumer_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        // Oldest visible pending job, skipping rows other claimers hold locked
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM collector_jobs
                WHERE state = 'pending'
                  AND visible_at <= NOW()
                  AND attempts < $1
                ORDER BY seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE collector_jobs j
            SET state = 'leased',
                lease_owner = $2,
                lease_expiry = NOW() + make_interval(secs => $3),
                attempts = j.attempts + 1,
                updated_at = NOW()
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.payload, j.state, j.attempts, j.lease_owner, j.lease_expiry,
                      j.last_error, j.created_at, j.updated_at
            "#,
        )
        .bind(attempts_bound(self.policy.max_attempts)?)
        .bind(consumer_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim job: {}", e);
            unavailable(e)
        })?;

        let job = row.as_ref().map(row_to_job).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.label(), consumer_id, attempts = job.attempts, "claimed job");
        }
        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = %job.label()))]
    async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        let job_id = job.id.ok_or(QueueError::MissingJobId)?;

        let row = sqlx::query(
            r#"
            UPDATE collector_jobs
            SET state = 'completed',
                lease_owner = NULL,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'leased'
              AND lease_owner = $2
              AND attempts = $3
              AND lease_expiry > NOW()
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(job.lease_owner.as_deref())
        .bind(job.attempts as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete job: {}", e);
            unavailable(e)
        })?;

        if row.is_none() {
            return Err(self.lease_error(job_id).await);
        }

        debug!("completed job");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.label()))]
    async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        let job_id = job.id.ok_or(QueueError::MissingJobId)?;
        let requeue = self.policy.should_requeue(job.attempts);
        let delay = if requeue {
            self.policy.delay_for_attempt(job.attempts + 1)
        } else {
            Duration::ZERO
        };

        let row = sqlx::query(
            r#"
            UPDATE collector_jobs
            SET state = CASE WHEN $4 THEN 'pending' ELSE 'failed' END,
                visible_at = CASE WHEN $4 THEN NOW() + make_interval(secs => $5)
                                  ELSE visible_at END,
                last_error = $6,
                lease_owner = NULL,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND state = 'leased'
              AND lease_owner = $2
              AND attempts = $3
              AND lease_expiry > NOW()
            RETURNING attempts
            "#,
        )
        .bind(job_id)
        .bind(job.lease_owner.as_deref())
        .bind(job.attempts as i32)
        .bind(requeue)
        .bind(delay.as_secs_f64())
        .bind(message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fail job: {}", e);
            unavailable(e)
        })?;

        let Some(row) = row else {
            return Err(self.lease_error(job_id).await);
        };
        let attempts = row.get::<i32, _>("attempts") as u32;

        if requeue {
            debug!(attempts, ?delay, "job will retry");
            Ok(FailOutcome::Requeued { attempts, delay })
        } else if self.policy.requeue_on_fail {
            debug!(attempts, "job exhausted its attempts");
            Ok(FailOutcome::AttemptsExceeded)
        } else {
            debug!(attempts, "job failed");
            Ok(FailOutcome::Failed)
        }
    }

    #[instrument(skip(self))]
    async fn repair(&self) -> Result<Vec<JobId>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE collector_jobs
            SET attempts = attempts + 1,
                state = CASE WHEN attempts + 1 >= $1 THEN 'failed' ELSE 'pending' END,
                last_error = CASE WHEN attempts + 1 >= $1 THEN $2 ELSE last_error END,
                lease_owner = NULL,
                lease_expiry = NULL,
                visible_at = NOW(),
                updated_at = NOW()
            WHERE state = 'leased'
              AND lease_expiry <= NOW()
            RETURNING id
            "#,
        )
        .bind(attempts_bound(self.policy.max_attempts)?)
        .bind(LEASE_EXPIRED_MESSAGE)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to repair expired leases: {}", e);
            unavailable(e)
        })?;

        let repaired: Vec<JobId> = rows.iter().map(|r| r.get("id")).collect();
        if !repaired.is_empty() {
            debug!(count = repaired.len(), "repaired expired leases");
        }
        Ok(repaired)
    }

    async fn size(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM collector_jobs WHERE state IN ('pending', 'leased')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(count.max(0) as usize)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM collector_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.pool.close().await;
        info!("Job database connection closed");
        Ok(())
    }
}
