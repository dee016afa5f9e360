//! CLI surface: default loop mode, `--once`, `--interval`.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "jobforge-worker", about = "Polls a Postgres-backed job queue and runs registered handlers")]
pub struct Cli {
    /// Process exactly one claim batch and exit instead of looping forever.
    #[arg(long)]
    pub once: bool,

    /// Override `POLL_INTERVAL_S` for this run.
    #[arg(long, value_name = "SECONDS")]
    pub interval: Option<u64>,
}
