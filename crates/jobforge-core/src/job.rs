//! The job data model shared by the queue client, executor, and registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution state of a job row, as owned by the queue store.
///
/// `Running` holds iff `locked_by` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are absorbing for a given attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead | JobStatus::Canceled
        )
    }
}

/// A job as claimed by this worker: the minimal shape the executor needs to
/// run an attempt. Mirrors the `RETURNING` clause of the claim query.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Present when the producer supplied one; the executor prefers this
    /// over generating a fresh trace id so that correlation survives across
    /// a producer's own request and the job that fulfills it.
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<Uuid>,
}

/// The full wire shape of a job row, used by administrative operations
/// (`list_jobs`) where the executor's narrower `ClaimedJob` is insufficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub error: Option<crate::classify::ErrorRecord>,
    pub idempotency_key: Option<String>,
}

/// Append-only record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub job_id: Uuid,
    pub attempt_no: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<crate::classify::ErrorRecord>,
}

/// Terminal disposition reported to the queue store by `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Succeeded,
    Failed,
}
