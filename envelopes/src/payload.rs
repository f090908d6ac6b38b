//! Per-topic payload schemas (second-stage decode).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CodecError, Envelope, JOIN_TOPIC};

pub const MESSAGE_TOPIC: &str = "message";
pub const STATUS_TOPIC: &str = "status";
pub const TYPING_TOPIC: &str = "typing";
pub const ERROR_TOPIC: &str = "error";

/// A chat message from a user or an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(alias = "content", alias = "message")]
    pub text: String,
}

/// Lifecycle update for an agent (e.g. `"thinking"`, `"idle"`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(alias = "state")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    #[serde(alias = "typing")]
    pub is_typing: bool,
}

/// Error report pushed by the server over the realtime connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(alias = "error")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Envelope content decoded according to its topic.
#[derive(Clone, Debug, PartialEq)]
pub enum TopicPayload {
    Message(ChatMessage),
    Status(AgentStatus),
    Typing(Typing),
    Error(ServerError),
    Join { thread_id: Option<String> },
    /// Topic without a registered schema; content with JSON-in-JSON unwrapped.
    Unknown(Value),
}

impl TopicPayload {
    /// Decode `envelope` using the schema registered for its topic.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when a known topic carries content
    /// that does not match its schema. Unknown topics never fail.
    pub fn decode(envelope: &Envelope) -> Result<Self, CodecError> {
        match envelope.topic() {
            MESSAGE_TOPIC => envelope.payload().map(Self::Message),
            STATUS_TOPIC => envelope.payload().map(Self::Status),
            TYPING_TOPIC => envelope.payload().map(Self::Typing),
            ERROR_TOPIC => envelope.payload().map(Self::Error),
            JOIN_TOPIC => Ok(Self::Join {
                thread_id: envelope.thread_id().map(str::to_owned),
            }),
            _ => Ok(Self::Unknown(envelope.payload_value())),
        }
    }
}

fn default_role() -> String {
    "assistant".to_owned()
}
