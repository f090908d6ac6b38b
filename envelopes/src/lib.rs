//! Envelope model and line-delimited JSON codec for the realtime connection.
//!
//! This crate owns the wire representation used by both the `courier` core and
//! the CLI. Envelope content stays flexible (`serde_json::Value`) at the outer
//! layer; topics with a known shape are decoded a second time through
//! [`TopicPayload`], which also unwraps content that arrives as a JSON-encoded
//! string.

mod payload;

pub use payload::{
    AgentStatus, ChatMessage, ERROR_TOPIC, MESSAGE_TOPIC, STATUS_TOPIC, ServerError, TYPING_TOPIC,
    TopicPayload, Typing,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Topic of the control envelope that asks the server for a room's updates.
pub const JOIN_TOPIC: &str = "join";

/// Pseudo-topic that observes every inbound envelope.
pub const WILDCARD_TOPIC: &str = "*";

/// Error returned by [`decode_line`] and payload decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The line is not a JSON object with the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The envelope carried an empty `type`.
    #[error("envelope is missing a topic")]
    MissingTopic,
    /// The content did not match the schema registered for the topic.
    #[error("payload for `{topic}` does not match its schema: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single message on the realtime wire protocol.
///
/// Fields are private so an envelope cannot change after construction; build
/// one with [`Envelope::new`] or [`Envelope::join`] and read it through the
/// accessors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

impl Envelope {
    /// Build an envelope stamped with the current UTC time.
    #[must_use]
    pub fn new(topic: impl Into<String>, content: Value) -> Self {
        Self {
            topic: topic.into(),
            thread_id: None,
            content,
            timestamp: Some(now_rfc3339()),
        }
    }

    /// Build the `join` control envelope for a room.
    #[must_use]
    pub fn join(thread_id: impl Into<String>) -> Self {
        Self {
            topic: JOIN_TOPIC.to_owned(),
            thread_id: Some(thread_id.into()),
            content: Value::Null,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Topic name (the wire `type` field).
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Raw outer content, before any second-stage decode.
    #[must_use]
    pub fn content(&self) -> &Value {
        &self.content
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    /// Parse the RFC 3339 timestamp, if present and well formed.
    #[must_use]
    pub fn timestamp_parsed(&self) -> Option<OffsetDateTime> {
        let raw = self.timestamp.as_deref()?;
        match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(parsed) => Some(parsed),
            Err(_) => None,
        }
    }

    /// Content with one level of JSON-in-JSON unwrapped.
    ///
    /// A string that itself parses as JSON is returned parsed; any other
    /// content is returned unchanged.
    #[must_use]
    pub fn payload_value(&self) -> Value {
        match &self.content {
            Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or_else(|_| self.content.clone()),
            other => other.clone(),
        }
    }

    /// Decode the content into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when the (unwrapped) content does not
    /// match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.payload_value()).map_err(|source| CodecError::Payload {
            topic: self.topic.clone(),
            source,
        })
    }
}

/// Encode an envelope as a single newline-terminated JSON line.
#[must_use]
pub fn encode_line(envelope: &Envelope) -> String {
    // Serializing string keys and `Value` content cannot fail.
    let mut line = serde_json::to_string(envelope).unwrap_or_default();
    line.push('\n');
    line
}

/// Decode one line into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for non-JSON or wrongly shaped input and
/// [`CodecError::MissingTopic`] when `type` is empty.
pub fn decode_line(line: &str) -> Result<Envelope, CodecError> {
    let envelope: Envelope = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
    if envelope.topic.is_empty() {
        return Err(CodecError::MissingTopic);
    }
    Ok(envelope)
}

/// Split a transport chunk into its non-blank envelope lines.
pub fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
