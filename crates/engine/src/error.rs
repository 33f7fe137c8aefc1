//! Task failure taxonomy
//!
//! Failures never cross the worker boundary as panics or raised errors. A
//! handler returns a [`TaskError`]; the worker converts it into exactly one
//! terminal [`TaskFailure`] that is delivered to the task's error callback.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// Classification of a single failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream asked us to slow down (HTTP 429)
    RateLimited,
    /// Upstream failed on its side (HTTP 5xx, garbled response)
    ServerError,
    /// Upstream rejected the request (invalid credentials, bad input)
    ClientError,
    /// Transport failure before a response was received
    NetworkError,
    /// Payload could not be understood by the handler
    InvalidInput,
    /// Rejected locally because the circuit breaker is open
    CircuitOpen,
    /// Execution exceeded the task timeout
    Timeout,
    /// Execution was cancelled by worker shutdown
    Cancelled,
    /// Anything else (I/O failures, panics in blocking work)
    Internal,
}

impl ErrorKind {
    /// Only upstream throttling and upstream server faults are worth retrying
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::ServerError)
    }

    /// Whether a failure of this kind counts against a circuit breaker
    ///
    /// Client-side mistakes prove the dependency answered, so they do not
    /// open the circuit.
    pub fn trips_circuit(self) -> bool {
        !matches!(
            self,
            Self::ClientError | Self::InvalidInput | Self::CircuitOpen | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
            Self::InvalidInput => "invalid_input",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a task handler for one attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Failure classification, drives retry and circuit decisions
    pub kind: ErrorKind,

    /// Human readable message
    pub message: String,

    /// Additional error details (for debugging)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, message)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("timed out after {limit:?}"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by worker shutdown")
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(format!("malformed payload: {err}"))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

/// Terminal failure of a logical task, delivered once to its error callback
///
/// The variants map onto what a UI needs to tell apart: retryable failure
/// exhausted, fatal failure, local rejection, too slow, and shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskFailure {
    /// Retryable failures continued past the retry budget
    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TaskError },

    /// Failure that retrying cannot fix (bad input, rejected credentials)
    #[error("{0}")]
    Fatal(TaskError),

    /// Rejected locally without calling the dependency (circuit open)
    #[error("rejected: {0}")]
    Rejected(TaskError),

    /// Execution exceeded the task timeout
    #[error("timed out after {limit:?}")]
    TimedOut {
        #[serde(with = "duration_millis")]
        limit: Duration,
    },

    /// Worker stopped before the task could finish
    #[error("cancelled before completion")]
    Cancelled,
}

impl TaskFailure {
    /// Kind of the underlying error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { last, .. } => last.kind,
            Self::Fatal(err) | Self::Rejected(err) => err.kind,
            Self::TimedOut { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The last handler error, when one exists
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Fatal(err) | Self::Rejected(err) => Some(err),
            Self::TimedOut { .. } | Self::Cancelled => None,
        }
    }

    /// Map a non-retried handler error onto its terminal failure
    pub(crate) fn from_error(err: TaskError, limit: Option<Duration>) -> Self {
        match err.kind {
            ErrorKind::Timeout => Self::TimedOut {
                limit: limit.unwrap_or_default(),
            },
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::CircuitOpen => Self::Rejected(err),
            _ => Self::Fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
        assert!(!ErrorKind::Timeout.is_retryable());
    }

    #[test]
    fn test_client_errors_do_not_trip_circuit() {
        assert!(!ErrorKind::ClientError.trips_circuit());
        assert!(!ErrorKind::InvalidInput.trips_circuit());
        assert!(ErrorKind::ServerError.trips_circuit());
        assert!(ErrorKind::NetworkError.trips_circuit());
        assert!(ErrorKind::Timeout.trips_circuit());
    }

    #[test]
    fn test_failure_from_error() {
        let limit = Duration::from_millis(250);
        assert_eq!(
            TaskFailure::from_error(TaskError::timeout(limit), Some(limit)),
            TaskFailure::TimedOut { limit }
        );
        assert_eq!(
            TaskFailure::from_error(TaskError::cancelled(), None),
            TaskFailure::Cancelled
        );
        assert!(matches!(
            TaskFailure::from_error(TaskError::circuit_open("open"), None),
            TaskFailure::Rejected(_)
        ));
        assert!(matches!(
            TaskFailure::from_error(TaskError::invalid_input("bad"), None),
            TaskFailure::Fatal(_)
        ));
    }

    #[test]
    fn test_failure_serializes_with_outcome_tag() {
        let failure = TaskFailure::Exhausted {
            attempts: 3,
            last: TaskError::server_error("boom"),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["outcome"], "exhausted");
        assert_eq!(json["attempts"], 3);
        assert_eq!(json["last"]["kind"], "server_error");

        let parsed: TaskFailure = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, failure);
    }

    #[test]
    fn test_display() {
        let err = TaskError::client_error("invalid api key");
        assert_eq!(err.to_string(), "client_error: invalid api key");
        assert_eq!(
            TaskFailure::Rejected(TaskError::circuit_open("circuit breaker is open")).to_string(),
            "rejected: circuit_open: circuit breaker is open"
        );
    }
}
