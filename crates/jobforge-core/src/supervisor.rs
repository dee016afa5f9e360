//! The poll loop / supervisor — top-level state machine that claims
//! batches, fans jobs out to executors, and drains on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, WorkerConfig};
use crate::executor;
use crate::queue::QueueClient;
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Polling,
    Draining,
    Stopped,
}

/// Counts from a completed `run_once` invocation, useful for tests and for
/// serverless/cron entrypoints that want a summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOnceSummary {
    pub claimed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub struct Supervisor {
    queue: Arc<dyn QueueClient>,
    registry: HandlerRegistry,
    config: WorkerConfig,
    active: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(queue: Arc<dyn QueueClient>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current count of in-flight executors. Read-only; never used to gate
    /// concurrency, only for metrics and logging.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Runs the full loop, installing its own Ctrl-C handler as the
    /// shutdown trigger. Most callers want this; tests that need a
    /// deterministic shutdown trigger should use [`Supervisor::run_with_shutdown`].
    pub async fn run(self) -> Result<(), SupervisorError> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
                signal_token.cancel();
            }
        });
        self.run_with_shutdown(shutdown).await
    }

    /// Runs the full `Starting -> Polling -> Draining -> Stopped` loop,
    /// triggering drain when `shutdown` is cancelled.
    pub async fn run_with_shutdown(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        self.config.validate()?;
        let mut state = SupervisorState::Starting;
        debug!(?state, "supervisor starting");

        state = SupervisorState::Polling;
        info!(?state, worker_id = %self.config.worker_id, "supervisor polling");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        // Plain join handles, not a JoinSet: a JoinSet aborts everything
        // still inside it when dropped, which would cancel jobs abandoned
        // past the shutdown grace period instead of letting them run to
        // completion in the background.
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let available = semaphore.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            let limit = self.config.claim_limit.min(available as i64);
            let claimed = match self.queue.claim(&self.config.worker_id, limit).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(error = %err, "claim failed, will retry after poll_interval");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for job in claimed {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                let queue = self.queue.clone();
                let registry = self.registry.clone();
                let worker_id = self.config.worker_id.clone();
                let heartbeat_interval = self.config.heartbeat_interval;
                let job_timeout = self.config.job_timeout;
                let job_shutdown = shutdown.clone();
                let active = self.active.clone();

                active.fetch_add(1, Ordering::Relaxed);
                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    executor::execute(
                        queue,
                        registry,
                        worker_id,
                        job,
                        heartbeat_interval,
                        job_timeout,
                        job_shutdown,
                    )
                    .await;
                    active.fetch_sub(1, Ordering::Relaxed);
                }));
            }

            // Reap finished tasks without blocking the next claim tick.
            tasks.retain(|t| !t.is_finished());
        }

        state = SupervisorState::Draining;
        info!(?state, remaining = tasks.len(), "draining in-flight jobs");

        let grace = self.config.shutdown_grace;
        let remaining = tasks.len();
        // Drain by value: if the timeout below fires, this future (and its
        // partially-consumed iterator) is simply dropped. Dropping an
        // unfinished `JoinHandle` await does not abort the underlying task,
        // so any executors still running at that point keep running in the
        // background exactly as spec'd.
        let drained = tokio::time::timeout(grace, async {
            for task in tasks.drain(..) {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining,
                "shutdown grace period elapsed; abandoning remaining executors in the background (their leases will expire)"
            );
        }

        state = SupervisorState::Stopped;
        info!(?state, "supervisor stopped");
        Ok(())
    }

    /// Claims exactly one batch, processes all returned jobs concurrently,
    /// waits for completion, and returns.
    pub async fn run_once(self) -> Result<RunOnceSummary, SupervisorError> {
        self.config.validate()?;
        let claimed = self
            .queue
            .claim(&self.config.worker_id, self.config.claim_limit)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "claim failed in run_once");
                Vec::new()
            });

        let mut tasks: JoinSet<()> = JoinSet::new();
        let claimed_count = claimed.len();
        let no_shutdown = CancellationToken::new();

        for job in claimed {
            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let worker_id = self.config.worker_id.clone();
            let heartbeat_interval = self.config.heartbeat_interval;
            let job_timeout = self.config.job_timeout;
            let shutdown = no_shutdown.clone();
            tasks.spawn(async move {
                executor::execute(
                    queue,
                    registry,
                    worker_id,
                    job,
                    heartbeat_interval,
                    job_timeout,
                    shutdown,
                )
                .await;
            });
        }

        while tasks.join_next().await.is_some() {}

        Ok(RunOnceSummary {
            claimed: claimed_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::registry::{HandlerError, HandlerRegistry, JobHandler};
    use async_trait::async_trait;
    use jobforge_testing::InMemoryQueueClient;
    use std::time::Duration;

    struct Echo;
    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(
            &self,
            payload: serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(payload)
        }
    }

    struct Sleeps(Duration);
    #[async_trait]
    impl JobHandler for Sleeps {
        async fn handle(
            &self,
            payload: serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(payload)
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-1".to_string(),
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(5),
            claim_limit: 10,
            max_concurrent: 10,
            job_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(200),
            store_lease_ttl: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn run_once_processes_exactly_one_batch() {
        let queue = Arc::new(InMemoryQueueClient::new());
        queue.seed_queued("echo", serde_json::json!({"n": 1}), 3);
        queue.seed_queued("echo", serde_json::json!({"n": 2}), 3);

        let registry = HandlerRegistry::builder()
            .register("echo", Echo, Duration::from_secs(5), 3)
            .unwrap()
            .build();

        let supervisor = Supervisor::new(queue.clone(), registry, config());
        let summary = supervisor.run_once().await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(queue.claim_call_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_new_claims_and_exits_within_grace() {
        let queue = Arc::new(InMemoryQueueClient::new());
        // A job that sleeps far longer than the grace period; its executor
        // will be abandoned rather than awaited forever.
        queue.seed_queued("slow", serde_json::json!({}), 3);

        let registry = HandlerRegistry::builder()
            .register("slow", Sleeps(Duration::from_secs(10)), Duration::from_secs(30), 3)
            .unwrap()
            .build();

        let mut cfg = config();
        cfg.shutdown_grace = Duration::from_millis(50);
        let supervisor = Supervisor::new(queue.clone(), registry, cfg);

        let shutdown = CancellationToken::new();
        let shutdown_trigger = shutdown.clone();

        let start = std::time::Instant::now();
        let run_handle = tokio::spawn(supervisor.run_with_shutdown(shutdown));

        // Let the first claim happen, then signal shutdown almost
        // immediately; no further claims should occur afterward.
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_trigger.cancel();

        run_handle.await.unwrap().unwrap();
        let elapsed = start.elapsed();

        // Exits at ~shutdown_grace, not at the handler's full 10s sleep.
        assert!(elapsed < Duration::from_secs(2), "elapsed={elapsed:?}");

        let claims_at_shutdown = queue.claim_call_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            queue.claim_call_count(),
            claims_at_shutdown,
            "no claims should occur after the supervisor has stopped"
        );
    }

    #[tokio::test]
    async fn config_validation_error_surfaces_from_run_once() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let registry = HandlerRegistry::builder().build();
        let mut cfg = config();
        cfg.worker_id = String::new();
        let supervisor = Supervisor::new(queue, registry, cfg);
        assert!(supervisor.run_once().await.is_err());
    }
}
