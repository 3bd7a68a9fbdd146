use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkerCapabilities;

pub const WORKER_REGISTRATION: &str = "worker_registration";
pub const WORKER_REGISTRATION_ACK: &str = "worker_registration_ack";

/// Handshake messages exchanged before a worker joins the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    WorkerRegistration(WorkerRegistration),
    WorkerRegistrationAck(RegistrationAck),
}

/// First frame a worker sends on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub worker_name: String,
    pub capabilities: WorkerCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Server reply to a registration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegistrationAck {
    pub fn accepted<S: Into<String>>(session_id: S) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.into()),
            error: None,
        }
    }

    pub fn rejected<S: Into<String>>(error: S) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }

    /// Whether the rejection was caused by a bad or missing token.
    pub fn is_auth_failure(&self) -> bool {
        !self.success
            && self
                .error
                .as_deref()
                .is_some_and(|e| e.to_lowercase().contains("authentication"))
    }
}

impl ControlMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Reads the `type` discriminator of an arbitrary wire message.
pub fn message_type(message: &Value) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}
