//! PostgreSQL implementation of [`jobforge_core::QueueClient`].
//!
//! This is the production queue store: `claim` uses `FOR UPDATE SKIP
//! LOCKED` so concurrently-polling workers never double-claim a row, and
//! `complete` decides retry-vs-dead internally from the reported
//! `retryable` flag and remaining attempts — the worker only ever reports
//! an outcome, it never computes backoff itself.
//!
//! # Database schema
//!
//! See `migrations/0001_init.sql` at the workspace root for the full
//! `CREATE TABLE`. In short:
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id               UUID PRIMARY KEY,
//!     tenant_id        UUID NOT NULL,
//!     job_type         TEXT NOT NULL,
//!     payload          JSONB NOT NULL,
//!     status           TEXT NOT NULL DEFAULT 'queued',
//!     attempts         INTEGER NOT NULL DEFAULT 0,
//!     max_attempts     INTEGER NOT NULL,
//!     run_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     locked_by        TEXT,
//!     locked_at        TIMESTAMPTZ,
//!     heartbeat_at     TIMESTAMPTZ,
//!     created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     error            JSONB,
//!     result           JSONB,
//!     idempotency_key  TEXT,
//!     correlation_id   UUID
//! );
//! ```

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobforge_core::classify::ErrorRecord;
use jobforge_core::job::{Attempt, ClaimedJob, Disposition, Job, JobStatus};
use jobforge_core::queue::{QueueClient, QueueError};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// The store's lease TTL: a job's lease is considered expired, and the job
/// re-claimable, once `heartbeat_at` (or `locked_at` if no heartbeat has
/// landed yet) is older than this.
#[derive(Debug, Clone, Copy)]
pub struct LeaseTtl(pub chrono::Duration);

impl Default for LeaseTtl {
    fn default() -> Self {
        Self(chrono::Duration::seconds(90))
    }
}

/// PostgreSQL-backed [`QueueClient`].
///
/// Cheap to clone: the inner [`PgPool`] is itself a pooled, shareable
/// handle, so one `PgQueueClient` is typically constructed once at
/// startup and cloned into every executor task.
#[derive(Clone)]
pub struct PgQueueClient {
    pool: PgPool,
    lease_ttl: LeaseTtl,
}

impl PgQueueClient {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ttl: LeaseTtl::default(),
        }
    }

    pub fn with_lease_ttl(pool: PgPool, lease_ttl: LeaseTtl) -> Self {
        Self { pool, lease_ttl }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Periodic maintenance: returns jobs whose lease expired without a
    /// terminal write (crash, power loss) to `queued` so they can be
    /// re-claimed. Not part of the `QueueClient` contract — run this from
    /// a janitor task, not from the hot claim path.
    pub async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let lease_secs = self.lease_ttl.0.num_seconds() as f64;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                locked_by = NULL,
                locked_at = NULL
            WHERE status = 'running'
              AND COALESCE(heartbeat_at, locked_at) < now() - make_interval(secs => $1)
            "#,
        )
        .bind(lease_secs)
        .execute(&self.pool)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Administrative snapshot of queue health, used by a worker's own
    /// metrics endpoint (not by the executor/supervisor).
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued')    AS queued,
                COUNT(*) FILTER (WHERE status = 'running')   AS running,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'dead')      AS dead
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

        Ok(QueueStats {
            queued: row.get("queued"),
            running: row.get("running"),
            succeeded: row.get("succeeded"),
            dead: row.get("dead"),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub dead: i64,
}

fn backoff_seconds(attempts: i32) -> f64 {
    2f64.powi((attempts - 1).max(0)).min(3600.0)
}

fn parse_status(raw: &str) -> JobStatus {
    match raw {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        "dead" => JobStatus::Dead,
        "canceled" => JobStatus::Canceled,
        other => unreachable!("unknown job status in store: {other}"),
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Dead => "dead",
        JobStatus::Canceled => "canceled",
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    let error: Option<serde_json::Value> = row.get("error");
    Job {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        job_type: row.get("job_type"),
        payload: row.get("payload"),
        status: parse_status(row.get::<String, _>("status").as_str()),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        run_at: row.get("run_at"),
        locked_by: row.get("locked_by"),
        locked_at: row.get("locked_at"),
        heartbeat_at: row.get("heartbeat_at"),
        created_at: row.get("created_at"),
        error: error.and_then(|v| serde_json::from_value(v).ok()),
        idempotency_key: row.get("idempotency_key"),
    }
}

#[async_trait]
impl QueueClient for PgQueueClient {
    /// Atomically claims up to `limit` eligible jobs. The `FOR UPDATE SKIP
    /// LOCKED` CTE guarantees two concurrently-polling workers never both
    /// win the same row: whichever transaction locks a row first wins it,
    /// and the other silently skips it rather than blocking.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>, QueueError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND run_at <= now()
                  AND attempts < max_attempts
                ORDER BY run_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                locked_by = $2,
                locked_at = now(),
                heartbeat_at = now(),
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, tenant_id, job_type, payload, attempts, max_attempts,
                      idempotency_key, correlation_id
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedJob {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                job_type: row.get("job_type"),
                payload: row.get("payload"),
                attempts: row.get("attempts"),
                max_attempts: row.get("max_attempts"),
                idempotency_key: row.get("idempotency_key"),
                correlation_id: row.get("correlation_id"),
            })
            .collect())
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = now()
            WHERE id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Terminal transition for one attempt. Retry-vs-dead is decided here,
    /// not by the caller: a retryable failure with attempts remaining
    /// re-queues with backoff; anything else goes to `dead`.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        disposition: Disposition,
        result: Option<serde_json::Value>,
        error: Option<ErrorRecord>,
    ) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;

        let row = sqlx::query(
            "SELECT locked_by, locked_at, attempts, max_attempts FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?
        .ok_or(QueueError::NotFound(job_id))?;

        let locked_by: Option<String> = row.get("locked_by");
        if locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        let locked_at: Option<DateTime<Utc>> = row.get("locked_at");
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");

        sqlx::query(
            r#"
            INSERT INTO job_attempts (job_id, attempt_no, started_at, finished_at, error)
            VALUES ($1, $2, $3, now(), $4)
            "#,
        )
        .bind(job_id)
        .bind(attempts)
        .bind(locked_at.unwrap_or_else(Utc::now))
        .bind(error.as_ref().map(|e| serde_json::to_value(e).unwrap_or_default()))
        .execute(&mut *tx)
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

        match disposition {
            Disposition::Succeeded => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded',
                        locked_by = NULL,
                        locked_at = NULL,
                        result = $2,
                        error = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(result)
                .execute(&mut *tx)
                .await
                .map_err(|err| QueueError::Transport(err.to_string()))?;
            }
            Disposition::Failed => {
                let record = error.context("Failed disposition must carry an error record");
                let record = record.map_err(|err| QueueError::Transport(err.to_string()))?;
                let error_json = serde_json::to_value(&record).unwrap_or_default();

                if record.retryable && attempts < max_attempts {
                    let delay_secs = backoff_seconds(attempts);
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'queued',
                            run_at = now() + make_interval(secs => $2),
                            locked_by = NULL,
                            locked_at = NULL,
                            error = $3
                        WHERE id = $1
                        "#,
                    )
                    .bind(job_id)
                    .bind(delay_secs)
                    .bind(error_json)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| QueueError::Transport(err.to_string()))?;
                } else {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'dead',
                            locked_by = NULL,
                            locked_at = NULL,
                            error = $2
                        WHERE id = $1
                        "#,
                    )
                    .bind(job_id)
                    .bind(error_json)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| QueueError::Transport(err.to_string()))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid, tenant_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("UPDATE jobs SET status = 'canceled' WHERE id = $1 AND tenant_id = $2")
            .bind(job_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query("UPDATE jobs SET run_at = $3 WHERE id = $1 AND tenant_id = $2")
            .bind(job_id)
            .bind(tenant_id)
            .bind(run_at)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    /// `filters` may carry an optional `job_type` string to narrow the
    /// result; any other shape is ignored rather than rejected, since the
    /// core never interprets this argument.
    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        filters: serde_json::Value,
    ) -> Result<Vec<Job>, QueueError> {
        let job_type = filters.get("job_type").and_then(|v| v.as_str());

        let rows = match job_type {
            Some(job_type) => sqlx::query(
                r#"
                SELECT id, tenant_id, job_type, payload, status, attempts, max_attempts,
                       run_at, locked_by, locked_at, heartbeat_at, created_at, error,
                       idempotency_key
                FROM jobs
                WHERE tenant_id = $1 AND job_type = $2
                ORDER BY created_at DESC
                LIMIT 200
                "#,
            )
            .bind(tenant_id)
            .bind(job_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?,
            None => sqlx::query(
                r#"
                SELECT id, tenant_id, job_type, payload, status, attempts, max_attempts,
                       run_at, locked_by, locked_at, heartbeat_at, created_at, error,
                       idempotency_key
                FROM jobs
                WHERE tenant_id = $1
                ORDER BY created_at DESC
                LIMIT 200
                "#,
            )
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?,
        };

        Ok(rows.iter().map(row_to_job).collect())
    }
}

/// Reconstructs an [`Attempt`] row for diagnostic/administrative reads.
/// Not used on the executor's hot path — the executor never reads its own
/// attempt history back.
pub async fn attempts_for(pool: &PgPool, job_id: Uuid) -> Result<Vec<Attempt>, QueueError> {
    let rows = sqlx::query(
        "SELECT job_id, attempt_no, started_at, finished_at, error FROM job_attempts WHERE job_id = $1 ORDER BY attempt_no ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .map_err(|err| QueueError::Transport(err.to_string()))?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let error: Option<serde_json::Value> = row.get("error");
            Attempt {
                job_id: row.get("job_id"),
                attempt_no: row.get("attempt_no"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                error: error.and_then(|v| serde_json::from_value(v).ok()),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_starts_at_one_second() {
        assert_eq!(backoff_seconds(1), 1.0);
        assert_eq!(backoff_seconds(2), 2.0);
        assert_eq!(backoff_seconds(12), 2048.0);
        assert_eq!(backoff_seconds(13), 3600.0);
        assert_eq!(backoff_seconds(20), 3600.0);
    }

    #[test]
    fn status_round_trips_through_its_string_form() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Dead,
            JobStatus::Canceled,
        ] {
            assert_eq!(parse_status(status_str(status)), status);
        }
    }
}
