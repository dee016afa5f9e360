//! The queue store's interface: the four-plus-two RPC surface the executor
//! and supervisor depend on. The concrete Postgres
//! implementation lives in the separate `jobforge-postgres` crate; this
//! crate only defines the contract and an in-memory fake lives in
//! `jobforge-testing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::classify::ErrorRecord;
use crate::job::{ClaimedJob, Disposition, Job};

/// Any failure talking to the queue store. Surfaced to callers as a single
/// kind; the executor converts this into a retryable `QueueError` outcome
/// for the *current* job.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("transport error talking to queue store: {0}")]
    Transport(String),
    #[error("lease not held: job {job_id} is not locked by worker {worker_id}")]
    LeaseLost { job_id: Uuid, worker_id: String },
    #[error("job {0} not found")]
    NotFound(Uuid),
}

/// The queue store RPC surface.
///
/// All four core operations are implemented against a shared, transactional
/// store so that `claim` is race-free across concurrently-polling workers
/// and `heartbeat`/`complete` are rejected unless the caller holds the
/// lease.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Atomically transitions up to `limit` eligible jobs `queued -> running`
    /// and returns them. Selection order is `run_at ASC, priority DESC (if
    /// present), created_at ASC`. Must never double-claim a job across
    /// concurrent callers.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Refreshes the lease on a running job. Fails with
    /// `QueueError::LeaseLost` if `worker_id` does not hold the lease or the
    /// job is no longer running.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<(), QueueError>;

    /// Terminal transition for one attempt. On `Failed`, the store decides
    /// retry-vs-dead internally based on `error.retryable` and remaining
    /// attempts — never the executor.
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        disposition: Disposition,
        result: Option<serde_json::Value>,
        error: Option<ErrorRecord>,
    ) -> Result<(), QueueError>;

    /// Administrative: cancel a queued or running job.
    async fn cancel(&self, job_id: Uuid, tenant_id: Uuid) -> Result<(), QueueError>;

    /// Administrative: move a job's `run_at` without touching its status.
    async fn reschedule(
        &self,
        job_id: Uuid,
        tenant_id: Uuid,
        run_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Administrative: list jobs for a tenant. `filters` is store-specific;
    /// the core never interprets it.
    async fn list_jobs(
        &self,
        tenant_id: Uuid,
        filters: serde_json::Value,
    ) -> Result<Vec<Job>, QueueError>;
}
