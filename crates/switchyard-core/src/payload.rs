//! Typed payloads for each [`MessageType`].
//!
//! None of these structs deny unknown fields, so newer peers can add fields
//! without breaking older ones.

use crate::capability::Capability;
use crate::error::{ErrorReason, SwitchyardError};
use crate::message::{MessageType, WirePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `REGISTER`: an agent joins the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    /// Requested identity. The broker assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Skills this agent offers.
    pub capabilities: Vec<Capability>,
    /// Maximum tasks held at once.
    pub max_concurrent: u32,
}

impl WirePayload for Register {
    const KIND: MessageType = MessageType::Register;
}

/// `HEARTBEAT`: liveness ping. Carries no data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {}

impl WirePayload for Heartbeat {
    const KIND: MessageType = MessageType::Heartbeat;
}

/// `DEREGISTER`: the agent leaves; held tasks are requeued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deregister {}

impl WirePayload for Deregister {
    const KIND: MessageType = MessageType::Deregister;
}

/// `SUBMIT_TASK`: a submitter enqueues work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTask {
    /// Capability an agent must declare to receive this task.
    pub capability: Capability,
    /// Opaque to the broker.
    pub payload: serde_json::Value,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Overrides the configured `retry_attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Overrides the configured per-attempt `task_timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WirePayload for SubmitTask {
    const KIND: MessageType = MessageType::SubmitTask;
}

/// `ASSIGN`: the broker hands one attempt of a task to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    /// Task being assigned.
    pub task_id: Uuid,
    /// Capability the task requires.
    pub capability: Capability,
    /// Submitter's opaque payload.
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The attempt is failed if no result arrives by then.
    pub deadline: DateTime<Utc>,
}

impl WirePayload for Assign {
    const KIND: MessageType = MessageType::Assign;
}

/// `TASK_RESULT`: successful output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Completed task.
    pub task_id: Uuid,
    /// Agent output, opaque to the broker.
    pub output: serde_json::Value,
}

impl WirePayload for TaskResult {
    const KIND: MessageType = MessageType::TaskResult;
}

/// One failed attempt, reported back in `TASK_ERROR` history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Agent that held the attempt.
    pub agent_id: String,
    /// Why it failed.
    pub reason: ErrorReason,
    /// Human-readable detail.
    pub message: String,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// `TASK_ERROR`: a failed attempt (agent → broker) or a terminal failure or
/// rejection (broker → submitter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Absent when a submission was rejected before a task existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// Reason code.
    pub reason: ErrorReason,
    /// Human-readable detail.
    pub message: String,
    /// Failed attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl TaskError {
    /// Creates an error without attempt history.
    pub fn new(task_id: Option<Uuid>, reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            task_id,
            reason,
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    /// The typed error for a terminal failure of a task that needed
    /// `capability`. Reasons without a dedicated variant come back as
    /// [`SwitchyardError::Rejected`].
    pub fn into_error(self, capability: &Capability) -> SwitchyardError {
        let attempts = self.attempts.last().map_or(0, |a| a.attempt);
        match self.reason {
            ErrorReason::TaskTimeout => SwitchyardError::TaskTimeout { attempts },
            ErrorReason::TaskRetryExhausted => SwitchyardError::TaskRetryExhausted { attempts },
            ErrorReason::CapabilityMismatch => {
                SwitchyardError::CapabilityMismatch(capability.to_string())
            }
            ErrorReason::Shutdown => SwitchyardError::ShuttingDown,
            reason => SwitchyardError::Rejected {
                reason,
                message: self.message,
            },
        }
    }
}

impl WirePayload for TaskError {
    const KIND: MessageType = MessageType::TaskError;
}

/// `CANCEL`: stop a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    /// Task to cancel.
    pub task_id: Uuid,
}

impl WirePayload for Cancel {
    const KIND: MessageType = MessageType::Cancel;
}

/// `PROGRESS`: intermediate output relayed to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Running task.
    pub task_id: Uuid,
    /// Opaque progress data.
    pub progress: serde_json::Value,
}

impl WirePayload for Progress {
    const KIND: MessageType = MessageType::Progress;
}

/// `ACK`: positive or negative acknowledgment of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request was accepted.
    pub ok: bool,
    /// Task the request concerned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// Agent identity granted at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorReason>,
    /// Rejection detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    /// Accepts a task-scoped request.
    pub fn task(task_id: Uuid) -> Self {
        Self {
            ok: true,
            task_id: Some(task_id),
            agent_id: None,
            reason: None,
            message: None,
        }
    }

    /// Accepts a registration.
    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            task_id: None,
            agent_id: Some(agent_id.into()),
            reason: None,
            message: None,
        }
    }

    /// Rejects a request.
    pub fn rejected(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            task_id: None,
            agent_id: None,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }
}

impl WirePayload for Ack {
    const KIND: MessageType = MessageType::Ack;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    #[test]
    fn test_submit_defaults() {
        let msg = Message::new(
            MessageType::SubmitTask,
            "orchestrator",
            json!({"capability": "web_search", "payload": {"q": "rust"}}),
        );
        let submit: SubmitTask = msg.payload_as().unwrap();
        assert_eq!(submit.capability, Capability::WebSearch);
        assert_eq!(submit.priority, 0);
        assert!(submit.max_attempts.is_none());
    }

    #[test]
    fn test_unknown_payload_fields_tolerated() {
        let msg = Message::new(
            MessageType::Register,
            "a1",
            json!({"capabilities": ["x"], "max_concurrent": 2, "region": "eu"}),
        );
        let reg: Register = msg.payload_as().unwrap();
        assert_eq!(reg.max_concurrent, 2);
        // The envelope itself keeps the unknown field.
        assert_eq!(msg.payload["region"], "eu");
    }

    #[test]
    fn test_payload_kind_mismatch() {
        let msg = Message::from_payload("a1", &Heartbeat::default());
        assert!(msg.payload_as::<Register>().is_err());
    }

    #[test]
    fn test_missing_required_payload_field() {
        let msg = Message::new(MessageType::Cancel, "s", json!({}));
        assert!(msg.payload_as::<Cancel>().is_err());
    }

    #[test]
    fn test_task_error_maps_to_typed_error() {
        let attempt = |n| AttemptRecord {
            attempt: n,
            agent_id: "a1".into(),
            reason: ErrorReason::AgentFailure,
            message: "boom".into(),
            at: Utc::now(),
        };
        let mut exhausted = TaskError::new(None, ErrorReason::TaskRetryExhausted, "gave up");
        exhausted.attempts = vec![attempt(1), attempt(2), attempt(3)];
        assert!(matches!(
            exhausted.into_error(&Capability::CodeExec),
            SwitchyardError::TaskRetryExhausted { attempts: 3 }
        ));

        let mut timed_out = TaskError::new(None, ErrorReason::TaskTimeout, "late");
        timed_out.attempts = vec![attempt(1)];
        assert!(matches!(
            timed_out.into_error(&Capability::CodeExec),
            SwitchyardError::TaskTimeout { attempts: 1 }
        ));

        let starved = TaskError::new(None, ErrorReason::CapabilityMismatch, "no agent");
        match starved.into_error(&Capability::from("translate")) {
            SwitchyardError::CapabilityMismatch(cap) => assert_eq!(cap, "translate"),
            other => panic!("unexpected {other:?}"),
        }

        let failed = TaskError::new(None, ErrorReason::AgentFailure, "segfault");
        match failed.into_error(&Capability::CodeExec) {
            SwitchyardError::Rejected { reason, message } => {
                assert_eq!(reason, ErrorReason::AgentFailure);
                assert_eq!(message, "segfault");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejected_ack() {
        let ack = Ack::rejected(ErrorReason::DuplicateAgent, "taken");
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["reason"], "duplicate_agent");
        assert!(value.get("task_id").is_none());
    }
}
