//! The job executor — runs exactly one claimed job through its lifecycle:
//! establish trace id, dispatch, heartbeat, invoke under timeout, classify,
//! complete.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::{classify_handler_error, ErrorKind, ErrorRecord};
use crate::context::{with_trace_id, JobContext};
use crate::heartbeat;
use crate::job::{ClaimedJob, Disposition};
use crate::queue::QueueClient;
use crate::registry::HandlerRegistry;

/// Executes one claimed job to a terminal outcome.
///
/// Returns once the terminal `complete` call has been attempted (or given
/// up on after a transport failure — the job's lease will later expire in
/// the store and it will be re-claimed).
pub async fn execute(
    queue: Arc<dyn QueueClient>,
    registry: HandlerRegistry,
    worker_id: String,
    job: ClaimedJob,
    heartbeat_cadence: Duration,
    default_timeout: Duration,
    shutdown: CancellationToken,
) {
    let trace_id = job.correlation_id.unwrap_or_else(Uuid::new_v4);
    let span = info_span!(
        "job",
        job_id = %job.id,
        job_type = %job.job_type,
        tenant_id = %job.tenant_id,
        attempt_no = job.attempts,
        trace_id = %trace_id,
        worker_id = %worker_id,
    );

    with_trace_id(
        trace_id,
        run_attempt(
            queue,
            registry,
            worker_id,
            job,
            trace_id,
            heartbeat_cadence,
            default_timeout,
            shutdown,
        )
        .instrument(span),
    )
    .await;
}

async fn run_attempt(
    queue: Arc<dyn QueueClient>,
    registry: HandlerRegistry,
    worker_id: String,
    job: ClaimedJob,
    trace_id: Uuid,
    heartbeat_cadence: Duration,
    default_timeout: Duration,
    shutdown: CancellationToken,
) {
    let registration = match registry.lookup(&job.job_type) {
        Some(reg) => reg,
        None => {
            warn!("no handler registered for job type");
            complete_failed(
                &queue,
                &worker_id,
                job.id,
                ErrorRecord::new(ErrorKind::NoHandler, job.attempts, "no handler registered")
                    .non_retryable(),
            )
            .await;
            return;
        }
    };

    if !registration.handler.validate(&job.payload) {
        warn!("payload failed validation");
        complete_failed(
            &queue,
            &worker_id,
            job.id,
            ErrorRecord::new(
                ErrorKind::ValidationFailed,
                job.attempts,
                "payload failed validation",
            )
            .non_retryable(),
        )
        .await;
        return;
    }

    let heartbeat_handle = heartbeat::spawn(
        queue.clone(),
        job.id,
        worker_id.clone(),
        heartbeat_cadence,
    );

    let cancel = CancellationToken::new();
    let timeout = if registration.timeout.is_zero() {
        default_timeout
    } else {
        registration.timeout
    };

    let ctx = JobContext {
        job_id: job.id,
        tenant_id: job.tenant_id,
        attempt_no: job.attempts,
        trace_id,
        cancel: cancel.clone(),
    };

    let handler = registration.handler.clone();
    let payload = job.payload.clone();
    let blocking = handler.blocking();

    let invocation = async move {
        if blocking {
            let handler = handler.clone();
            tokio::task::spawn_blocking(move || {
                tokio::runtime::Handle::current().block_on(handler.handle(payload, ctx))
            })
            .await
            .map_err(|join_err| {
                HandlerErrorOrJoin::Join(format!("handler task panicked: {join_err}"))
            })
            .and_then(|res| res.map_err(HandlerErrorOrJoin::Handler))
        } else {
            handler
                .handle(payload, ctx)
                .await
                .map_err(HandlerErrorOrJoin::Handler)
        }
    };

    // Shutdown or timeout fires the cooperative cancel signal; cancellation
    // itself is best-effort and handlers are not required to observe it.
    let shutdown_watch = {
        let cancel = cancel.clone();
        async move {
            shutdown.cancelled().await;
            cancel.cancel();
        }
    };

    let outcome = tokio::select! {
        biased;
        result = tokio::time::timeout(timeout, invocation) => result,
        _ = shutdown_watch => {
            // Keep waiting for the handler; shutdown only asked it to stop
            // cooperatively. The supervisor's grace period, not this
            // select, is what eventually abandons the task.
            std::future::pending().await
        }
    };

    heartbeat_handle.stop().await;

    match outcome {
        Ok(Ok(result)) => {
            info!("job succeeded");
            if let Err(err) = queue
                .complete(job.id, &worker_id, Disposition::Succeeded, Some(result), None)
                .await
            {
                error!(error = %err, "terminal complete(succeeded) call failed; lease will expire and the job may be re-claimed");
            }
        }
        Ok(Err(HandlerErrorOrJoin::Handler(handler_err))) => {
            warn!(error = %handler_err, "job handler returned an error");
            let record = classify_handler_error(job.attempts, &handler_err);
            complete_failed(&queue, &worker_id, job.id, record).await;
        }
        Ok(Err(HandlerErrorOrJoin::Join(message))) => {
            error!(%message, "job handler task failed to run");
            let record = ErrorRecord::new(ErrorKind::HandlerError, job.attempts, message);
            complete_failed(&queue, &worker_id, job.id, record).await;
        }
        Err(_elapsed) => {
            warn!(?timeout, "job timed out");
            cancel.cancel();
            let record = ErrorRecord::new(
                ErrorKind::Timeout,
                job.attempts,
                format!("handler exceeded timeout of {timeout:?}"),
            );
            complete_failed(&queue, &worker_id, job.id, record).await;
        }
    }
}

enum HandlerErrorOrJoin {
    Handler(crate::registry::HandlerError),
    Join(String),
}

async fn complete_failed(
    queue: &Arc<dyn QueueClient>,
    worker_id: &str,
    job_id: Uuid,
    error: ErrorRecord,
) {
    if let Err(err) = queue
        .complete(job_id, worker_id, Disposition::Failed, None, Some(error))
        .await
    {
        error!(%job_id, error = %err, "terminal complete(failed) call failed; lease will expire and the job may be re-claimed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_trace_id;
    use crate::registry::{HandlerError, HandlerRegistry, JobHandler};
    use async_trait::async_trait;
    use jobforge_testing::InMemoryQueueClient;
    use std::sync::atomic::{AtomicU32, Ordering};

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

    struct AlwaysFails;
    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(
            &self,
            _payload: serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Err(HandlerError::retryable("upstream unavailable"))
        }
    }

    struct RejectsPayload;
    #[async_trait]
    impl JobHandler for RejectsPayload {
        async fn handle(
            &self,
            payload: serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(payload)
        }
        fn validate(&self, _payload: &serde_json::Value) -> bool {
            false
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

    struct ChecksTraceId;
    #[async_trait]
    impl JobHandler for ChecksTraceId {
        async fn handle(
            &self,
            _payload: serde_json::Value,
            ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            let ambient = current_trace_id();
            Ok(serde_json::json!({
                "explicit": ctx.trace_id.to_string(),
                "ambient": ambient.map(|id| id.to_string()),
            }))
        }
    }

    fn registry_with<H: JobHandler + 'static>(
        job_type: &str,
        handler: H,
        timeout: Duration,
        max_attempts: i32,
    ) -> HandlerRegistry {
        HandlerRegistry::builder()
            .register(job_type, handler, timeout, max_attempts)
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn executes_successful_job_to_completion() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("echo", serde_json::json!({"x": 1}), 3);
        let claimed = queue.claim("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let registry = registry_with("echo", Echo, Duration::from_secs(5), 3);
        execute(
            queue.clone(),
            registry,
            "worker-1".to_string(),
            claimed.into_iter().next().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(queue.result_of(job_id).await, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn transient_failure_then_success_retries_to_completion() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("flaky", serde_json::json!({}), 3);

        struct FlakyTwice(AtomicU32);
        #[async_trait]
        impl JobHandler for FlakyTwice {
            async fn handle(
                &self,
                payload: serde_json::Value,
                _ctx: JobContext,
            ) -> Result<serde_json::Value, HandlerError> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HandlerError::retryable("not yet"))
                } else {
                    Ok(payload)
                }
            }
        }

        let registry = registry_with(
            "flaky",
            FlakyTwice(AtomicU32::new(0)),
            Duration::from_secs(5),
            3,
        );

        for _ in 0..3 {
            // each attempt may have pushed run_at into the future via
            // backoff; jump the clock by forcing run_at back to now.
            if let Some(job) = queue.get_job(job_id).await {
                if job.status == crate::job::JobStatus::Queued {
                    queue
                        .reschedule(job_id, job.tenant_id, chrono::Utc::now())
                        .await
                        .unwrap();
                }
            }
            let claimed = queue.claim("worker-1", 10).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            execute(
                queue.clone(),
                registry.clone(),
                "worker-1".to_string(),
                claimed.into_iter().next().unwrap(),
                Duration::from_secs(30),
                Duration::from_secs(5),
                CancellationToken::new(),
            )
            .await;
        }

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Succeeded);
        let log = queue.attempts_log(job_id).await;
        assert_eq!(log.len(), 3);
        assert!(log[0].error.is_some());
        assert!(log[1].error.is_some());
        assert!(log[2].error.is_none());
    }

    #[tokio::test]
    async fn validation_failure_short_circuits_to_dead_in_one_attempt() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("rejects", serde_json::json!({}), 5);
        let claimed = queue.claim("worker-1", 10).await.unwrap();

        let registry = registry_with("rejects", RejectsPayload, Duration::from_secs(5), 5);
        execute(
            queue.clone(),
            registry,
            "worker-1".to_string(),
            claimed.into_iter().next().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.unwrap().kind, ErrorKind::ValidationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_failed_with_timeout_kind() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("slow", serde_json::json!({}), 3);
        let claimed = queue.claim("worker-1", 10).await.unwrap();

        let registry = registry_with(
            "slow",
            Sleeps(Duration::from_secs(60)),
            Duration::from_secs(2),
            3,
        );

        let handle = tokio::spawn(execute(
            queue.clone(),
            registry,
            "worker-1".to_string(),
            claimed.into_iter().next().unwrap(),
            Duration::from_millis(100),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        tokio::time::advance(Duration::from_secs(3)).await;
        handle.await.unwrap();

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unknown_job_type_is_terminal_and_never_invokes_a_handler() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("mystery", serde_json::json!({}), 3);
        let claimed = queue.claim("worker-1", 10).await.unwrap();

        let registry = HandlerRegistry::builder().build();
        execute(
            queue.clone(),
            registry,
            "worker-1".to_string(),
            claimed.into_iter().next().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;

        let job = queue.get_job(job_id).await.unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Dead);
        assert_eq!(job.error.unwrap().kind, ErrorKind::NoHandler);
    }

    #[tokio::test]
    async fn trace_id_seen_by_handler_matches_explicit_context_field() {
        let queue = Arc::new(InMemoryQueueClient::new());
        let job_id = queue.seed_queued("trace", serde_json::json!({}), 3);
        let claimed = queue.claim("worker-1", 10).await.unwrap();

        let registry = registry_with("trace", ChecksTraceId, Duration::from_secs(5), 3);
        execute(
            queue.clone(),
            registry,
            "worker-1".to_string(),
            claimed.into_iter().next().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .await;

        let result = queue.result_of(job_id).await.unwrap();
        assert_eq!(result["explicit"], result["ambient"]);
    }
}
