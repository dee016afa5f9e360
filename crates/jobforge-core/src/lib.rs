//! # jobforge-core
//!
//! Worker-side engine for a Postgres-backed distributed job queue: the
//! claim/heartbeat/complete protocol (as the [`queue::QueueClient`] trait),
//! the executor that runs one job attempt to a terminal outcome, the
//! handler registry jobs dispatch through, and the supervisor that drives
//! the poll loop to completion or graceful shutdown.
//!
//! This crate has no opinion about *where* jobs are stored. The Postgres
//! implementation lives in `jobforge-postgres`; tests in this crate and
//! downstream crates exercise the same code against the in-memory fake in
//! `jobforge-testing`.
//!
//! ## Layout
//!
//! - [`job`] — wire types: [`job::Job`], [`job::ClaimedJob`], [`job::Attempt`].
//! - [`classify`] — the closed [`classify::ErrorKind`] taxonomy and
//!   [`classify::ErrorRecord`] attached to failed attempts.
//! - [`registry`] — [`registry::JobHandler`] trait and the
//!   [`registry::HandlerRegistry`] jobs dispatch through by `job_type`.
//! - [`context`] — per-attempt [`context::JobContext`] and the task-local
//!   correlation id propagated to log lines emitted from inside a handler.
//! - [`queue`] — the [`queue::QueueClient`] store contract.
//! - [`heartbeat`] — the background lease-refresh driver.
//! - [`executor`] — runs a single claimed job through validation, dispatch,
//!   timeout, and terminal reporting.
//! - [`config`] — [`config::WorkerConfig`] and its cross-field invariants.
//! - [`supervisor`] — the poll loop and shutdown drain.

pub mod classify;
pub mod config;
pub mod context;
pub mod executor;
pub mod heartbeat;
pub mod job;
pub mod queue;
pub mod registry;
pub mod supervisor;

pub use classify::{ErrorKind, ErrorRecord};
pub use config::{ConfigError, WorkerConfig};
pub use context::JobContext;
pub use job::{Attempt, ClaimedJob, Disposition, Job, JobStatus};
pub use queue::{QueueClient, QueueError};
pub use registry::{HandlerError, HandlerRegistry, JobHandler, RegistryError};
pub use supervisor::{RunOnceSummary, Supervisor, SupervisorError, SupervisorState};

pub use async_trait::async_trait;
