//! Correlation context. A per-attempt trace id, installed by the executor
//! on entry and cleared on exit, accessible from anywhere inside that
//! attempt's logical call tree without a process-wide global.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

tokio::task_local! {
    /// The ambient trace id for the task currently executing a job attempt.
    /// Only ever set by `JobExecutor::run` for the duration of one attempt;
    /// never read or written from outside an executor task.
    static TRACE_ID: Uuid;
}

/// Data passed explicitly to every handler invocation. Handlers that want
/// the ambient form instead of reading this struct can
/// call [`current_trace_id`] from anywhere inside their own call tree,
/// provided they stay on the task the executor installed the slot on.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub attempt_no: i32,
    pub trace_id: Uuid,
    /// Signalled on timeout, shutdown, or (optionally) lease loss. Handlers
    /// are encouraged but not required to observe it.
    pub cancel: CancellationToken,
}

/// Runs `fut` with `trace_id` installed in the task-local slot. Concurrent
/// jobs never share a slot because each runs on its own spawned task and
/// `tokio::task_local!` is per-task storage.
pub async fn with_trace_id<F, T>(trace_id: Uuid, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE_ID.scope(trace_id, fut).await
}

/// Reads the trace id installed by the enclosing executor task, if any.
/// Returns `None` outside of an executor-managed task (e.g. in the poll
/// loop itself), which is intentional: correlation is per-attempt, not
/// process-wide.
pub fn current_trace_id() -> Option<Uuid> {
    TRACE_ID.try_with(|id| *id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_id_is_visible_inside_scope_and_absent_outside() {
        assert_eq!(current_trace_id(), None);
        let id = Uuid::new_v4();
        let seen = with_trace_id(id, async { current_trace_id() }).await;
        assert_eq!(seen, Some(id));
        assert_eq!(current_trace_id(), None);
    }

    #[tokio::test]
    async fn concurrent_jobs_do_not_see_each_others_trace_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let task_a = tokio::spawn(with_trace_id(a, async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            current_trace_id()
        }));
        let task_b = tokio::spawn(with_trace_id(b, async { current_trace_id() }));

        let (seen_a, seen_b) = tokio::join!(task_a, task_b);
        assert_eq!(seen_a.unwrap(), Some(a));
        assert_eq!(seen_b.unwrap(), Some(b));
    }
}
