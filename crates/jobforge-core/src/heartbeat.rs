//! The heartbeat driver — a background periodic task bound to one job's
//! lifetime.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{QueueClient, QueueError};

/// Handle to a running heartbeat driver. Dropping this without calling
/// [`HeartbeatHandle::stop`] leaks the background task until the process
/// exits; the executor always calls `stop` in its `finally`-equivalent path.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Cancels the driver and waits for its current tick (if any) to
    /// finish. Cancellation is only observed *between* ticks, never in the
    /// middle of one, so this may briefly block on an in-flight heartbeat
    /// RPC.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawns a heartbeat driver for `job_id`, issuing `heartbeat(job_id,
/// worker_id)` every `cadence` until stopped.
///
/// On `LeaseLost` or repeated transport failure the driver logs a warning
/// and keeps trying; the policy is to let the handler finish and let the
/// terminal call arbitrate with the store, not to abort the job from here.
pub fn spawn(
    queue: Arc<dyn QueueClient>,
    job_id: Uuid,
    worker_id: String,
    cadence: Duration,
) -> HeartbeatHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                _ = tokio::time::sleep(cadence) => {}
            }
            if task_cancel.is_cancelled() {
                break;
            }

            match queue.heartbeat(job_id, &worker_id).await {
                Ok(()) => debug!(%job_id, %worker_id, "heartbeat ok"),
                Err(QueueError::LeaseLost { .. }) => {
                    warn!(%job_id, %worker_id, "heartbeat rejected: lease lost");
                }
                Err(err) => {
                    warn!(%job_id, %worker_id, error = %err, "heartbeat transport failure");
                }
            }
        }
    });

    HeartbeatHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_testing::InMemoryQueueClient;

    #[tokio::test]
    async fn heartbeat_updates_lease_until_stopped() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue
            .seed_running("worker-1", "echo", serde_json::json!({}))
            .await;

        let handle = spawn(
            queue.clone(),
            job_id,
            "worker-1".to_string(),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;

        assert!(queue.heartbeat_count(job_id).await >= 2);
    }

    #[tokio::test]
    async fn stop_is_observed_between_ticks_not_mid_rpc() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue
            .seed_running("worker-1", "echo", serde_json::json!({}))
            .await;

        let handle = spawn(
            queue.clone(),
            job_id,
            "worker-1".to_string(),
            Duration::from_secs(3600),
        );

        // Cancel immediately, before the first tick ever fires; the driver
        // must exit without issuing a single heartbeat RPC.
        handle.stop().await;
        assert_eq!(queue.heartbeat_count(job_id).await, 0);
    }
}
