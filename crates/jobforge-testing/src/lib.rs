//! In-memory [`QueueClient`] implementation for exercising worker-core
//! behavior (the executor and poll loop) without a Postgres instance.
//!
//! A dependency only tests reach for, never shipped code.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use jobforge_core::classify::ErrorRecord;
use jobforge_core::job::{Attempt, ClaimedJob, Disposition, Job, JobStatus};
use jobforge_core::queue::{QueueClient, QueueError};
use uuid::Uuid;

struct Row {
    job: Job,
    heartbeat_count: u64,
    attempts_log: Vec<Attempt>,
    result: Option<serde_json::Value>,
}

/// An in-memory, single-process stand-in for the Postgres queue store.
///
/// Claim ordering and the retry/backoff math mirror
/// `jobforge-postgres::PgQueueClient` closely enough that tests written
/// against this fake exercise the same executor/supervisor code paths a
/// real deployment would.
pub struct InMemoryQueueClient {
    rows: DashMap<Uuid, Row>,
    default_lease: chrono::Duration,
    claim_calls: AtomicI64,
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            default_lease: ChronoDuration::seconds(60),
            claim_calls: AtomicI64::new(0),
        }
    }

    pub fn with_lease(lease: chrono::Duration) -> Self {
        Self {
            default_lease: lease,
            ..Self::new()
        }
    }

    /// Seeds a `queued` job ready for immediate claim. Returns its id.
    pub fn seed_queued(
        &self,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.rows.insert(
            id,
            Row {
                job: Job {
                    id,
                    tenant_id: Uuid::new_v4(),
                    job_type: job_type.into(),
                    payload,
                    status: JobStatus::Queued,
                    attempts: 0,
                    max_attempts,
                    run_at: now,
                    locked_by: None,
                    locked_at: None,
                    heartbeat_at: None,
                    created_at: now,
                    error: None,
                    idempotency_key: None,
                },
                heartbeat_count: 0,
                attempts_log: Vec::new(),
                result: None,
            },
        );
        id
    }

    /// Seeds a job already `running` and leased by `worker_id`, for tests
    /// that only exercise the heartbeat driver.
    pub async fn seed_running(
        &self,
        worker_id: &str,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Uuid {
        let id = self.seed_queued(job_type, payload, 3);
        self.claim(worker_id, 10).await.ok();
        // seed_queued may have created other rows in shared fixtures; force
        // this specific row into running state regardless of claim order.
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.job.status = JobStatus::Running;
            row.job.locked_by = Some(worker_id.to_string());
            row.job.locked_at = Some(Utc::now());
            row.job.attempts = row.job.attempts.max(1);
        }
        id
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.rows.get(&job_id).map(|r| r.job.clone())
    }

    pub async fn heartbeat_count(&self, job_id: Uuid) -> u64 {
        self.rows.get(&job_id).map(|r| r.heartbeat_count).unwrap_or(0)
    }

    pub async fn attempts_log(&self, job_id: Uuid) -> Vec<Attempt> {
        self.rows
            .get(&job_id)
            .map(|r| r.attempts_log.clone())
            .unwrap_or_default()
    }

    pub async fn result_of(&self, job_id: Uuid) -> Option<serde_json::Value> {
        self.rows.get(&job_id).and_then(|r| r.result.clone())
    }

    pub fn claim_call_count(&self) -> i64 {
        self.claim_calls.load(Ordering::Relaxed)
    }

    /// Test-only: forces a running job's lease to look expired and returns
    /// it to `queued`, simulating the store's own TTL-based reclaim path.
    pub async fn force_expire_lease(&self, job_id: Uuid) {
        if let Some(mut row) = self.rows.get_mut(&job_id) {
            row.job.status = JobStatus::Queued;
            row.job.locked_by = None;
            row.job.locked_at = None;
        }
    }
}

/// Mirrors `jobforge-postgres::backoff_seconds`: `min(cap, base * 2^(attempts-1))`
/// with `base = 1s`, `cap = 3600s`.
fn backoff(attempts: i32) -> ChronoDuration {
    let secs = 2i64.saturating_pow((attempts - 1).max(0) as u32).min(3600);
    ChronoDuration::seconds(secs)
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>, QueueError> {
        self.claim_calls.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let mut eligible: Vec<Uuid> = self
            .rows
            .iter()
            .filter(|entry| {
                let job = &entry.value().job;
                job.status == JobStatus::Queued
                    && job.run_at <= now
                    && job.attempts < job.max_attempts
            })
            .map(|entry| *entry.key())
            .collect();

        eligible.sort_by_key(|id| {
            let row = self.rows.get(id).unwrap();
            (row.job.run_at, row.job.created_at)
        });
        eligible.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let mut row = self.rows.get_mut(&id).unwrap();
            row.job.status = JobStatus::Running;
            row.job.locked_by = Some(worker_id.to_string());
            row.job.locked_at = Some(now);
            row.job.heartbeat_at = Some(now);
            row.job.attempts += 1;
            claimed.push(ClaimedJob {
                id: row.job.id,
                tenant_id: row.job.tenant_id,
                job_type: row.job.job_type.clone(),
                payload: row.job.payload.clone(),
                attempts: row.job.attempts,
                max_attempts: row.job.max_attempts,
                idempotency_key: row.job.idempotency_key.clone(),
                correlation_id: None,
            });
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        let mut row = self
            .rows
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if row.job.status != JobStatus::Running || row.job.locked_by.as_deref() != Some(worker_id)
        {
            return Err(QueueError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        row.job.heartbeat_at = Some(Utc::now());
        row.heartbeat_count += 1;
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        disposition: Disposition,
        result: Option<serde_json::Value>,
        error: Option<ErrorRecord>,
    ) -> Result<(), QueueError> {
        let mut row = self
            .rows
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        if row.job.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        row.attempts_log.push(Attempt {
            job_id,
            attempt_no: row.job.attempts,
            started_at: row.job.locked_at.unwrap_or_else(Utc::now),
            finished_at: Some(Utc::now()),
            error: error.clone(),
        });

        match disposition {
            Disposition::Succeeded => {
                row.job.status = JobStatus::Succeeded;
                row.job.locked_by = None;
                row.job.locked_at = None;
                row.result = result;
                row.job.error = None;
            }
            Disposition::Failed => {
                let record = error.expect("Failed disposition must carry an error record");
                let retryable = record.retryable;
                row.job.error = Some(record);
                if retryable && row.job.attempts < row.job.max_attempts {
                    let delay = backoff(row.job.attempts);
                    row.job.status = JobStatus::Queued;
                    row.job.run_at = Utc::now() + delay;
                    row.job.locked_by = None;
                    row.job.locked_at = None;
                } else {
                    row.job.status = JobStatus::Dead;
                    row.job.locked_by = None;
                    row.job.locked_at = None;
                }
            }
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid, tenant_id: Uuid) -> Result<(), QueueError> {
        let mut row = self
            .rows
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if row.job.tenant_id != tenant_id {
            return Err(QueueError::NotFound(job_id));
        }
        row.job.status = JobStatus::Canceled;
        Ok(())
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut row = self
            .rows
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if row.job.tenant_id != tenant_id {
            return Err(QueueError::NotFound(job_id));
        }
        row.job.run_at = run_at;
        Ok(())
    }

    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        _filters: serde_json::Value,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .rows
            .iter()
            .filter(|e| e.value().job.tenant_id == tenant_id)
            .map(|e| e.value().job.clone())
            .collect())
    }
}

/// Convenience for tests that need a shared, `Arc`-wrapped store.
pub fn shared() -> Arc<InMemoryQueueClient> {
    Arc::new(InMemoryQueueClient::new())
}
