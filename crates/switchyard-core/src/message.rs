//! Message envelope and JSON codec.
//!
//! Every frame on a broker connection is one [`Message`]. Encoding is
//! deterministic: envelope fields serialize in declaration order and payload
//! objects use `serde_json`'s sorted map.

use crate::error::{SwitchyardError, SwitchyardResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current payload schema version stamped on outgoing envelopes.
pub const SCHEMA_VERSION: u32 = 1;

/// Sender id used for messages originating at the broker.
pub const BROKER_SENDER: &str = "broker";

/// Kind of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent announces its capabilities.
    Register,
    /// Agent liveness ping.
    Heartbeat,
    /// Submitter enqueues a task.
    SubmitTask,
    /// Broker hands a task to an agent.
    Assign,
    /// Successful task output.
    TaskResult,
    /// Task or attempt failure.
    TaskError,
    /// Cancel a task.
    Cancel,
    /// Acknowledgment of a request.
    Ack,
    /// Intermediate progress for a running task.
    Progress,
    /// Agent leaves the pool.
    Deregister,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Register => "REGISTER",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::SubmitTask => "SUBMIT_TASK",
            MessageType::Assign => "ASSIGN",
            MessageType::TaskResult => "TASK_RESULT",
            MessageType::TaskError => "TASK_ERROR",
            MessageType::Cancel => "CANCEL",
            MessageType::Ack => "ACK",
            MessageType::Progress => "PROGRESS",
            MessageType::Deregister => "DEREGISTER",
        };
        f.write_str(s)
    }
}

/// The wire-level envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Unique identifier for this message.
    pub message_id: Uuid,
    /// `message_id` of the request this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Agent id, submitter label, or [`BROKER_SENDER`].
    pub sender_id: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Payload schema version.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Type-specific payload. Unknown fields are carried through untouched.
    pub payload: serde_json::Value,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// A typed payload bound to one [`MessageType`].
pub trait WirePayload: Serialize + DeserializeOwned {
    /// The envelope type this payload travels in.
    const KIND: MessageType;
}

impl Message {
    /// Creates a message with a raw JSON payload.
    pub fn new(kind: MessageType, sender_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            message_id: Uuid::new_v4(),
            correlation_id: None,
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }

    /// Creates a message from a typed payload.
    pub fn from_payload<P: WirePayload>(sender_id: impl Into<String>, payload: &P) -> Self {
        // Payload types are plain data; serialization cannot fail.
        let value = serde_json::to_value(payload).unwrap_or_default();
        Self::new(P::KIND, sender_id, value)
    }

    /// Creates a broker-originated reply to `request_id`.
    pub fn reply<P: WirePayload>(request_id: Uuid, payload: &P) -> Self {
        Self::from_payload(BROKER_SENDER, payload).correlated(request_id)
    }

    /// Sets the correlation id.
    pub fn correlated(mut self, request_id: Uuid) -> Self {
        self.correlation_id = Some(request_id);
        self
    }

    /// Decodes the payload into `P`, checking the envelope type.
    pub fn payload_as<P: WirePayload>(&self) -> SwitchyardResult<P> {
        if self.kind != P::KIND {
            return Err(SwitchyardError::MalformedMessage(format!(
                "expected {} payload, got {}",
                P::KIND,
                self.kind
            )));
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SwitchyardError::MalformedMessage(format!("invalid {} payload: {e}", self.kind))
        })
    }

    /// Encodes this message as a JSON text frame.
    pub fn encode(&self) -> SwitchyardResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a JSON text frame.
    pub fn decode(frame: &str) -> SwitchyardResult<Self> {
        serde_json::from_str(frame).map_err(|e| SwitchyardError::MalformedMessage(e.to_string()))
    }

    /// Decodes a binary frame holding UTF-8 JSON.
    pub fn decode_bytes(frame: &[u8]) -> SwitchyardResult<Self> {
        serde_json::from_slice(frame).map_err(|e| SwitchyardError::MalformedMessage(e.to_string()))
    }
}
