//! The handler registry — maps a job-type string to a handler, validator,
//! timeout, and max-attempts policy. Immutable after construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::JobContext;

/// An error a handler returns. Distinct from `ErrorKind::HandlerError`'s
/// record: this is what handler authors construct; the executor classifies
/// it into the closed `ErrorKind` set via `classify::classify_handler_error`.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub detail: Option<serde_json::Value>,
    /// When true, the executor reports this as non-retryable regardless of
    /// remaining attempts.
    pub terminal: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            terminal: false,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            terminal: true,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A job handler: invoked with the raw payload and the per-attempt context,
/// returns the job's inline result on success.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Optional payload validation, run before the handler is invoked.
    /// Returning `false` becomes a non-retryable `ValidationFailed` outcome
    /// without ever calling `handle`. Default accepts any payload.
    fn validate(&self, _payload: &serde_json::Value) -> bool {
        true
    }

    /// Whether this handler performs blocking I/O and must be run on a
    /// blocking-capable thread rather than the cooperative async runtime.
    /// Async handlers that only `.await` should leave this `false`.
    fn blocking(&self) -> bool {
        false
    }
}

/// One registration: a handler plus its per-job-type execution policy.
pub struct Registration {
    pub job_type: String,
    pub handler: Arc<dyn JobHandler>,
    pub timeout: Duration,
    pub max_attempts: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job type '{0}' is already registered")]
    DuplicateJobType(String),
}

/// Builder for a [`HandlerRegistry`]. Registration happens once at startup;
/// the built registry has no interior mutability.
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: HashMap<String, Registration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`. Duplicate registration for the
    /// same job type is a startup-time error.
    pub fn register(
        mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<Self, RegistryError> {
        let job_type = job_type.into();
        if self.registrations.contains_key(&job_type) {
            return Err(RegistryError::DuplicateJobType(job_type));
        }
        self.registrations.insert(
            job_type.clone(),
            Registration {
                job_type,
                handler: Arc::new(handler),
                timeout,
                max_attempts,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            registrations: Arc::new(self.registrations),
        }
    }
}

/// Immutable, freely-shareable handler registry. Cheap to clone: the inner
/// map is behind an `Arc`.
#[derive(Clone)]
pub struct HandlerRegistry {
    registrations: Arc<HashMap<String, Registration>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn lookup(&self, job_type: &str) -> Option<&Registration> {
        self.registrations.get(job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn duplicate_registration_is_a_startup_error() {
        let result = HandlerRegistry::builder()
            .register("echo", Echo, Duration::from_secs(5), 3)
            .unwrap()
            .register("echo", Echo, Duration::from_secs(5), 3);
        assert!(matches!(result, Err(RegistryError::DuplicateJobType(t)) if t == "echo"));
    }

    #[test]
    fn lookup_returns_none_for_unknown_type() {
        let registry = HandlerRegistry::builder()
            .register("echo", Echo, Duration::from_secs(5), 3)
            .unwrap()
            .build();
        assert!(registry.lookup("unknown").is_none());
        assert!(registry.lookup("echo").is_some());
    }
}
