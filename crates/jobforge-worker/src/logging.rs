//! Structured logging init: one JSON record per line, with
//! `timestamp, level, message, worker_id, trace_id?, job_id?, job_type?,
//! tenant_id?, attempt_no?` fields. The fields beyond `worker_id` are
//! attached as span fields by the executor (`executor::execute`'s
//! `info_span!`); this just wires the sink.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(false)
        .init();
}
