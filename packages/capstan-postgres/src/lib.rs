//! PostgreSQL-backed [`DurableQueue`] implementation.
//!
//! One `capstan_jobs` table is the broker shared by every worker process:
//! claiming uses `FOR UPDATE SKIP LOCKED` so a job is leased to at most one
//! executor at a time, and an expired lease makes the row claimable again
//! without operator intervention. Retry accounting lives in the row
//! (`attempt` / `max_attempts`), so workers on different hosts can never
//! disagree about whether a retry runs.
//!
//! ```ignore
//! let pool = PgPoolOptions::new().connect(&database_url).await?;
//! let queue = PostgresQueue::new(pool, RetryPolicy::default());
//! queue.run_migrations().await?;
//!
//! let engine = Engine::builder()
//!     .with_queue(Arc::new(queue))
//!     .with_task_fn::<SimulationInput, _, _>("simulate_portfolio", run_simulation)
//!     .build();
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use capstan::{
    DurableQueue, ErrorKind, Job, JobPriority, LeasedJob, QueuePhase, QueueRecord,
    RetryDisposition, RetryPolicy,
};

/// Embedded schema migrations for the `capstan_jobs` table.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const SELECT_COLUMNS: &str = "id, job_type, payload, correlation_id, idempotency_key, \
     priority, max_attempts, attempt, submitted_at";

/// PostgreSQL-backed durable queue.
pub struct PostgresQueue {
    pool: PgPool,
    retry: RetryPolicy,
    lease_ms: i64,
}

impl PostgresQueue {
    /// Create a queue with the default one-minute lease.
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            retry,
            lease_ms: 60_000,
        }
    }

    /// Create a queue with a custom lease duration.
    pub fn with_lease_duration(pool: PgPool, retry: RetryPolicy, lease: Duration) -> Self {
        Self {
            pool,
            retry,
            lease_ms: lease.as_millis().max(1) as i64,
        }
    }

    /// Apply the embedded migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, job: Job, run_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO capstan_jobs (
                id, job_type, payload, correlation_id, idempotency_key,
                priority, max_attempts, phase, next_run_at, submitted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(&job.correlation_id)
        .bind(&job.idempotency_key)
        .bind(job.priority.as_i16())
        .bind(job.max_attempts)
        .bind(run_at)
        .bind(job.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Row shape returned by the claim statement.
#[derive(FromRow)]
struct ClaimedRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    correlation_id: String,
    idempotency_key: Option<String>,
    priority: i16,
    max_attempts: i32,
    attempt: i32,
    submitted_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl ClaimedRow {
    fn into_leased(self) -> LeasedJob {
        let lease_expires_at = self.lease_expires_at.unwrap_or_else(Utc::now);
        LeasedJob {
            job: Job {
                id: self.id,
                job_type: self.job_type,
                payload: self.payload,
                correlation_id: self.correlation_id,
                idempotency_key: self.idempotency_key,
                priority: priority_from_i16(self.priority),
                max_attempts: self.max_attempts,
                submitted_at: self.submitted_at,
            },
            attempt: self.attempt,
            lease_expires_at,
        }
    }
}

fn priority_from_i16(value: i16) -> JobPriority {
    match value {
        0 => JobPriority::Critical,
        1 => JobPriority::High,
        3 => JobPriority::Low,
        _ => JobPriority::Normal,
    }
}

fn phase_from_str(value: &str) -> Result<QueuePhase> {
    match value {
        "pending" => Ok(QueuePhase::Pending),
        "running" => Ok(QueuePhase::Running),
        "succeeded" => Ok(QueuePhase::Succeeded),
        "failed" => Ok(QueuePhase::Failed),
        "cancelled" => Ok(QueuePhase::Cancelled),
        other => Err(anyhow!("unknown job phase in database: {other}")),
    }
}

fn kind_as_str(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Retryable => "retryable",
        ErrorKind::NonRetryable => "non_retryable",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Shutdown => "shutdown",
    }
}

#[async_trait]
impl DurableQueue for PostgresQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.insert(job, None).await
    }

    async fn schedule(&self, job: Job, run_at: DateTime<Utc>) -> Result<()> {
        self.insert(job, Some(run_at)).await
    }

    async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<LeasedJob>> {
        let rows = sqlx::query_as::<_, ClaimedRow>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM capstan_jobs
                WHERE (phase = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                   OR (phase = 'running' AND lease_expires_at < NOW())
                ORDER BY priority, COALESCE(next_run_at, submitted_at)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE capstan_jobs
            SET phase = 'running',
                attempt = CASE WHEN phase = 'pending' THEN attempt + 1 ELSE attempt END,
                lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                worker_id = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {SELECT_COLUMNS}, lease_expires_at
            "#
        ))
        .bind(limit as i64)
        .bind(self.lease_ms.to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        if !rows.is_empty() {
            debug!(worker_id, count = rows.len(), "claimed jobs");
        }
        Ok(rows.into_iter().map(ClaimedRow::into_leased).collect())
    }

    async fn extend_lease(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE capstan_jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND phase = 'running'
            "#,
        )
        .bind(self.lease_ms.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE capstan_jobs
            SET phase = 'succeeded',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: ErrorKind,
    ) -> Result<RetryDisposition> {
        let row = sqlx::query_as::<_, (i32, i32)>(
            "SELECT attempt, max_attempts FROM capstan_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| anyhow!("unknown job {job_id}"))?;
        let (attempt, max_attempts) = row;

        if kind.should_retry() && attempt < max_attempts {
            let delay = self.retry.delay_for(attempt);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
            sqlx::query(
                r#"
                UPDATE capstan_jobs
                SET phase = 'pending',
                    next_run_at = $1,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    error_message = $2,
                    error_kind = $3,
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(kind_as_str(kind))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            return Ok(RetryDisposition::Requeued {
                next_attempt: attempt + 1,
                retry_at,
            });
        }

        let terminal_phase = if kind == ErrorKind::Cancelled {
            "cancelled"
        } else {
            "failed"
        };
        sqlx::query(
            r#"
            UPDATE capstan_jobs
            SET phase = $1,
                lease_expires_at = NULL,
                error_message = $2,
                error_kind = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(terminal_phase)
        .bind(error)
        .bind(kind_as_str(kind))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(RetryDisposition::Exhausted)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE capstan_jobs
            SET phase = 'cancelled',
                error_kind = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND phase = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM capstan_jobs WHERE phase = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn lookup(&self, job_id: Uuid) -> Result<Option<QueueRecord>> {
        let row = sqlx::query_as::<_, (String, i32, Option<String>, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            SELECT phase, attempt, error_message, submitted_at, updated_at
            FROM capstan_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(phase, attempt, error_message, submitted_at, updated_at)| {
            Ok(QueueRecord {
                job_id,
                phase: phase_from_str(&phase)?,
                attempt,
                error_message,
                submitted_at,
                updated_at,
            })
        })
        .transpose()
    }
}
