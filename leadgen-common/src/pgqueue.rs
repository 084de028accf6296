//! Delivery job queue backed by the `delivery_jobs` PostgreSQL table.
//!
//! The queue is at-least-once: a dequeued job becomes invisible for a
//! visibility window, and a worker that crashes without acking simply lets
//! the window lapse so another worker picks the job up again. Work items
//! carry only the lead id; the executor re-reads authoritative lead state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::db;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {0}")]
    ConnectionError(#[source] sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error("job {0} has reached max attempts and cannot be retried further")]
    MaxAttemptsReached(i64),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "delivery_job_status", rename_all = "lowercase")]
pub enum JobStatus {
    Available,
    Running,
    Completed,
    Failed,
}

/// A delivery work item as dequeued for processing.
#[derive(Debug, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: i64,
    pub lead_id: i64,
    /// Dequeue count, including the current one.
    pub attempt: i32,
    pub max_attempts: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_by: Vec<String>,
}

impl DeliveryJob {
    /// Consume the job to retry it later. Fails when no attempts remain.
    pub fn retry(self, error: impl Into<String>) -> Result<RetryableJob, QueueError> {
        if self.attempt >= self.max_attempts {
            Err(QueueError::MaxAttemptsReached(self.id))
        } else {
            Ok(RetryableJob {
                id: self.id,
                error: error.into(),
            })
        }
    }

    pub fn complete(self) -> CompletedJob {
        CompletedJob { id: self.id }
    }

    pub fn fail(self, error: impl Into<String>) -> FailedJob {
        FailedJob {
            id: self.id,
            error: error.into(),
        }
    }
}

pub struct RetryableJob {
    pub id: i64,
    pub error: String,
}

pub struct CompletedJob {
    pub id: i64,
}

pub struct FailedJob {
    pub id: i64,
    pub error: String,
}

/// Enqueue one delivery work item for a lead.
///
/// Takes a generic executor so the producer can run it inside the same
/// transaction as the `validated -> routed` transition, making
/// "exactly one work item per successful transition" hold.
pub async fn enqueue_delivery<'c, E>(
    executor: E,
    lead_id: i64,
    max_attempts: i32,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO delivery_jobs (lead_id, status, attempt, max_attempts, scheduled_at)
VALUES ($1, 'available'::delivery_job_status, 0, $2, NOW())
        "#,
    )
    .bind(lead_id)
    .bind(max_attempts)
    .execute(executor)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "INSERT".to_owned(),
        error,
    })?;

    Ok(())
}

/// A queue handle for delivery workers.
pub struct DeliveryQueue {
    pool: PgPool,
    /// How long a dequeued job stays invisible before it is handed out again.
    visibility_timeout: Duration,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl DeliveryQueue {
    pub async fn new(url: &str, visibility_timeout: Duration) -> QueueResult<Self> {
        let pool = db::get_pool(url, 10)
            .await
            .map_err(QueueError::ConnectionError)?;
        Ok(Self::new_from_pool(pool, visibility_timeout))
    }

    pub fn new_from_pool(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dequeue the next due job, or a running job whose visibility window
    /// lapsed (its worker is presumed dead).
    pub async fn dequeue(&self, worker: &str) -> QueueResult<Option<DeliveryJob>> {
        let job: Option<DeliveryJob> = sqlx::query_as(
            r#"
WITH next_job AS (
    SELECT id
    FROM delivery_jobs
    WHERE (status = 'available'::delivery_job_status AND scheduled_at <= NOW())
       OR (status = 'running'::delivery_job_status AND visible_until < NOW())
    ORDER BY scheduled_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE delivery_jobs
SET status = 'running'::delivery_job_status,
    attempt = delivery_jobs.attempt + 1,
    visible_until = NOW() + make_interval(secs => $1),
    attempted_by = array_append(delivery_jobs.attempted_by, $2::text)
FROM next_job
WHERE delivery_jobs.id = next_job.id
RETURNING
    delivery_jobs.id,
    delivery_jobs.lead_id,
    delivery_jobs.attempt,
    delivery_jobs.max_attempts,
    delivery_jobs.status,
    delivery_jobs.created_at,
    delivery_jobs.scheduled_at,
    delivery_jobs.attempted_by
            "#,
        )
        .bind(self.visibility_timeout.as_secs_f64())
        .bind(worker)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(job)
    }

    /// Ack a job as done. Completed jobs stay in the table for tracing.
    pub async fn ack_completed(&self, job: CompletedJob) -> QueueResult<()> {
        sqlx::query(
            r#"
UPDATE delivery_jobs
SET status = 'completed'::delivery_job_status,
    finished_at = NOW(),
    visible_until = NULL
WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Nack a job back onto the queue after a delay.
    pub async fn ack_retryable(&self, job: RetryableJob, delay: Duration) -> QueueResult<()> {
        sqlx::query(
            r#"
UPDATE delivery_jobs
SET status = 'available'::delivery_job_status,
    scheduled_at = NOW() + make_interval(secs => $2),
    visible_until = NULL,
    last_error = $3
WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(delay.as_secs_f64())
        .bind(&job.error)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Ack a job as terminally failed. It remains visible for operators but
    /// will not be dequeued again.
    pub async fn ack_failed(&self, job: FailedJob) -> QueueResult<()> {
        sqlx::query(
            r#"
UPDATE delivery_jobs
SET status = 'failed'::delivery_job_status,
    finished_at = NOW(),
    visible_until = NULL,
    last_error = $2
WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.error)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_consumes_job_while_attempts_remain() {
        let job = DeliveryJob {
            id: 7,
            lead_id: 42,
            attempt: 1,
            max_attempts: 3,
            status: JobStatus::Running,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_by: vec!["w1".to_owned()],
        };

        let retryable = job.retry("HTTP 503").expect("attempts remain");
        assert_eq!(retryable.id, 7);
        assert_eq!(retryable.error, "HTTP 503");
    }

    #[test]
    fn retry_refuses_exhausted_job() {
        let job = DeliveryJob {
            id: 7,
            lead_id: 42,
            attempt: 3,
            max_attempts: 3,
            status: JobStatus::Running,
            created_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_by: vec![],
        };

        match job.retry("HTTP 503") {
            Err(QueueError::MaxAttemptsReached(7)) => {}
            other => panic!("expected MaxAttemptsReached, got {:?}", other.err()),
        }
    }
}
