//! The error classifier — maps a handler outcome to a structured
//! `ErrorRecord` carrying a retryability flag, drawn from a closed set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of error kinds a job attempt can terminate with.
///
/// This is intentionally not `#[non_exhaustive]`: the set is closed, and
/// callers (the store's retry accounting, dashboards) are expected to
/// match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    NoHandler,
    Timeout,
    HandlerError,
    QueueError,
    LeaseLost,
}

impl ErrorKind {
    /// Default retryability for this kind, before a handler's own
    /// terminal-error tag (if any) overrides it.
    pub fn default_retryable(self) -> bool {
        match self {
            ErrorKind::ValidationFailed => false,
            ErrorKind::NoHandler => false,
            ErrorKind::Timeout => true,
            ErrorKind::HandlerError => true,
            ErrorKind::QueueError => true,
            ErrorKind::LeaseLost => true,
        }
    }
}

/// The structured record passed as the `error` field of `complete(failed)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt_no: i32,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<serde_json::Value>,
    /// Whether this attempt should return to the queue. Defaults to
    /// `kind.default_retryable()` but a handler may tag its own error as
    /// terminal.
    pub retryable: bool,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, attempt_no: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt_no,
            timestamp: Utc::now(),
            detail: None,
            retryable: kind.default_retryable(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Force non-retryable regardless of `kind`'s default. Used when a
    /// handler tags its own `HandlerError` as terminal.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Classifies a raw handler failure into the closed `ErrorKind` set.
///
/// This is the single seam the executor calls on any non-success path; the
/// individual constructors on `ErrorRecord` above cover the cases (timeout,
/// no-handler, validation) the executor detects itself before ever invoking
/// the handler.
pub fn classify_handler_error(
    attempt_no: i32,
    error: &crate::registry::HandlerError,
) -> ErrorRecord {
    let record = ErrorRecord::new(ErrorKind::HandlerError, attempt_no, error.message.clone())
        .with_detail(error.detail.clone().unwrap_or(serde_json::Value::Null));
    if error.terminal {
        record.non_retryable()
    } else {
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_the_default_table() {
        assert!(!ErrorKind::ValidationFailed.default_retryable());
        assert!(!ErrorKind::NoHandler.default_retryable());
        assert!(ErrorKind::Timeout.default_retryable());
        assert!(ErrorKind::HandlerError.default_retryable());
        assert!(ErrorKind::QueueError.default_retryable());
        assert!(ErrorKind::LeaseLost.default_retryable());
    }

    #[test]
    fn handler_error_tagged_terminal_is_not_retryable() {
        let err = crate::registry::HandlerError::terminal("bad payload shape");
        let record = classify_handler_error(1, &err);
        assert_eq!(record.kind, ErrorKind::HandlerError);
        assert!(!record.retryable);
    }

    #[test]
    fn handler_error_default_is_retryable() {
        let err = crate::registry::HandlerError::retryable("upstream timed out");
        let record = classify_handler_error(2, &err);
        assert!(record.retryable);
    }
}
