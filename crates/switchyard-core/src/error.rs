use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Top-level error type for the Switchyard control plane.
///
/// Protocol and transport errors are contained per connection. Task-level
/// errors are reported to the submitter as a `TASK_ERROR` carrying the
/// matching [`ErrorReason`].
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// A frame could not be decoded into an envelope or payload.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The agent id is already held by a live registration.
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// The queue reached its admission ceiling.
    #[error("Queue full: {limit} tasks in flight")]
    QueueFull {
        /// Configured admission ceiling.
        limit: usize,
    },

    /// A task ran past its deadline on its final attempt.
    #[error("Task timed out after {attempts} attempt(s)")]
    TaskTimeout {
        /// Attempts consumed.
        attempts: u32,
    },

    /// A task failed on every permitted attempt.
    #[error("Task failed after {attempts} attempt(s)")]
    TaskRetryExhausted {
        /// Attempts consumed.
        attempts: u32,
    },

    /// No live agent declared the capability within the starvation window.
    #[error("No agent with capability '{0}'")]
    CapabilityMismatch(String),

    /// The client gave up waiting for a correlated response.
    #[error("No response within {0:?}")]
    ClientTimeout(Duration),

    /// The agent id is not registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// The task id is not tracked by the queue.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// The agent has no free concurrency slot.
    #[error("Agent '{0}' is at capacity")]
    AgentAtCapacity(String),

    /// A well-formed request that violates a precondition.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The broker answered a request with a negative ACK.
    #[error("Rejected ({reason}): {message}")]
    Rejected {
        /// Reason code from the ACK.
        reason: ErrorReason,
        /// Detail from the ACK.
        message: String,
    },

    /// The broker is draining and accepts no new work.
    #[error("Broker is shutting down")]
    ShuttingDown,

    /// The underlying connection failed or closed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchyardError {
    /// The wire-level reason code for this error.
    pub fn reason(&self) -> ErrorReason {
        match self {
            SwitchyardError::MalformedMessage(_) | SwitchyardError::Json(_) => {
                ErrorReason::MalformedMessage
            }
            SwitchyardError::DuplicateAgent(_) => ErrorReason::DuplicateAgent,
            SwitchyardError::QueueFull { .. } => ErrorReason::QueueFull,
            SwitchyardError::TaskTimeout { .. } => ErrorReason::TaskTimeout,
            SwitchyardError::TaskRetryExhausted { .. } => ErrorReason::TaskRetryExhausted,
            SwitchyardError::CapabilityMismatch(_) => ErrorReason::CapabilityMismatch,
            SwitchyardError::ShuttingDown => ErrorReason::Shutdown,
            SwitchyardError::Rejected { reason, .. } => *reason,
            _ => ErrorReason::InvalidRequest,
        }
    }
}

/// Reason codes carried by `TASK_ERROR` and rejecting `ACK` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Submission rejected by backpressure.
    QueueFull,
    /// Final attempt exceeded its deadline.
    TaskTimeout,
    /// Every attempt failed.
    TaskRetryExhausted,
    /// No agent ever offered the capability.
    CapabilityMismatch,
    /// The agent reported a failure for one attempt.
    AgentFailure,
    /// The task was cancelled.
    Cancelled,
    /// The broker shut down with the task in flight.
    Shutdown,
    /// Registration rejected because the id is taken.
    DuplicateAgent,
    /// Request violated a precondition.
    InvalidRequest,
    /// Payload could not be decoded.
    MalformedMessage,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorReason::QueueFull => "queue_full",
            ErrorReason::TaskTimeout => "task_timeout",
            ErrorReason::TaskRetryExhausted => "task_retry_exhausted",
            ErrorReason::CapabilityMismatch => "capability_mismatch",
            ErrorReason::AgentFailure => "agent_failure",
            ErrorReason::Cancelled => "cancelled",
            ErrorReason::Shutdown => "shutdown",
            ErrorReason::DuplicateAgent => "duplicate_agent",
            ErrorReason::InvalidRequest => "invalid_request",
            ErrorReason::MalformedMessage => "malformed_message",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            SwitchyardError::QueueFull { limit: 3 }.reason(),
            ErrorReason::QueueFull
        );
        assert_eq!(
            SwitchyardError::CapabilityMismatch("x".into()).reason(),
            ErrorReason::CapabilityMismatch
        );
        assert_eq!(
            SwitchyardError::UnknownTask("t".into()).reason(),
            ErrorReason::InvalidRequest
        );
        let rejected = SwitchyardError::Rejected {
            reason: ErrorReason::QueueFull,
            message: "full".into(),
        };
        assert_eq!(rejected.reason(), ErrorReason::QueueFull);
    }

    #[test]
    fn test_reason_display_matches_serde() {
        let json = serde_json::to_string(&ErrorReason::TaskRetryExhausted).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorReason::TaskRetryExhausted));
    }
}
