//! Deployable jobforge worker: wires a [`jobforge_core::HandlerRegistry`]
//! to a Postgres-backed [`jobforge_core::Supervisor`] and runs it to
//! completion or graceful shutdown.
//!
//! The binary target (`src/main.rs`) registers no handlers of its own —
//! concrete handler bodies are out of scope for this crate. Deployments
//! with real handlers call [`run`] from their own `main`, the way
//! `demos/http-request` and `demos/webhook-deliver` do.

pub mod cli;
pub mod config;
pub mod logging;

use std::sync::Arc;
use std::time::Duration;

use jobforge_core::{HandlerRegistry, Supervisor};
use sqlx::postgres::PgPoolOptions;

use cli::Cli;
use config::AppConfig;

/// Process exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_CRASH: i32 = 1;

/// Builds the Postgres pool, constructs the supervisor, and runs it in
/// either loop mode or `--once` mode depending on `cli`.
pub async fn run(cli: Cli, app: AppConfig, registry: HandlerRegistry) -> anyhow::Result<()> {
    let mut worker = app.worker;
    if let Some(interval) = cli.interval {
        worker.poll_interval = Duration::from_secs(interval);
    }

    let pool = PgPoolOptions::new()
        .max_connections(worker.max_concurrent as u32 + 2)
        .connect(&app.database_url)
        .await?;
    let lease_ttl = jobforge_postgres::LeaseTtl(chrono::Duration::from_std(worker.store_lease_ttl)?);
    let queue = Arc::new(jobforge_postgres::PgQueueClient::with_lease_ttl(pool, lease_ttl));

    let supervisor = Supervisor::new(queue, registry, worker);

    if cli.once {
        let summary = supervisor.run_once().await?;
        tracing::info!(claimed = summary.claimed, "run_once complete");
    } else {
        supervisor.run().await?;
    }

    Ok(())
}
