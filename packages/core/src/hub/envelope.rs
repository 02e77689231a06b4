//! Wire shapes for the broadcast hub.
//!
//! Outgoing messages are always an [`Envelope`]; incoming client frames are
//! parsed into [`ClientMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used for messages addressed to a single client.
pub const PERSONAL_TOPIC: &str = "personal";

/// Server -> client message: `{"topic": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            topic: topic.into(),
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn personal(payload: impl Serialize) -> Self {
        Self::new(PERSONAL_TOPIC, payload)
    }
}

/// Client -> server frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}
