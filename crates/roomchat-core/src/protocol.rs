//! Wire protocol for chat room sessions.
//!
//! Frames are JSON objects tagged by a `type` field. Outbound and inbound
//! shapes differ: the client addresses a recipient, the server stamps a
//! sender and timestamp.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::FrameError;

/// Opaque message identifier, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Time-based message id source.
///
/// Ids are millisecond timestamps, bumped forward when two sends land in
/// the same millisecond or the clock steps backwards, so they never repeat.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: u64,
}

impl MessageIdGenerator {
    /// Create a generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Issue the next id using the system clock.
    pub fn next_id(&mut self) -> MessageId {
        self.next_at(now_millis())
    }

    /// Issue the next id for an explicit clock reading.
    pub fn next_at(&mut self, now_ms: u64) -> MessageId {
        let value = now_ms.max(self.last.saturating_add(1));
        self.last = value;
        MessageId(value.to_string())
    }
}

/// Frame sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Chat message addressed to a recipient.
    ChatMessage {
        message_id: MessageId,
        message: String,
        recipient_id: String,
    },
    /// Receiver-side acknowledgment of an inbound chat message.
    MessageDelivered { message_id: MessageId },
    /// Typing indicator.
    Typing { is_typing: bool },
}

impl OutboundFrame {
    /// Serialize to the JSON text sent on the wire.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Chat message relayed by the server.
    ChatMessage(InboundChat),
    /// Another participant's typing state.
    Typing(TypingEvent),
    /// Far-end acknowledgment of one of our messages.
    MessageDelivered {
        #[serde(deserialize_with = "lenient_id")]
        message_id: MessageId,
    },
}

impl InboundFrame {
    /// Parse raw frame text.
    ///
    /// # Errors
    /// Returns [`FrameError::Malformed`] if the text is not JSON or does not
    /// match one of the recognized shapes.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Inbound chat message payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundChat {
    #[serde(deserialize_with = "lenient_id")]
    pub message_id: MessageId,
    pub message: String,
    #[serde(deserialize_with = "lenient_string")]
    pub sender_id: String,
    /// Display name of the sender, when the server provides one.
    #[serde(default)]
    pub sender: Option<String>,
    pub timestamp: String,
}

/// Typing indicator payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
}

// Servers that fall back to database ids emit them as integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Str(String),
    Signed(i64),
    Unsigned(u64),
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Str(s) => s,
        StringOrInt::Signed(n) => n.to_string(),
        StringOrInt::Unsigned(n) => n.to_string(),
    })
}

fn lenient_id<'de, D>(deserializer: D) -> Result<MessageId, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_string(deserializer).map(MessageId)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn test_outbound_chat_shape() {
        let frame = OutboundFrame::ChatMessage {
            message_id: MessageId::new("1700000000000"),
            message: "hi".to_string(),
            recipient_id: "42".to_string(),
        };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat_message",
                "message_id": "1700000000000",
                "message": "hi",
                "recipient_id": "42",
            })
        );
    }

    #[test]
    fn test_outbound_control_shapes() {
        let ack = OutboundFrame::MessageDelivered {
            message_id: MessageId::new("7"),
        };
        let value: Value = serde_json::from_str(&ack.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "message_delivered", "message_id": "7"}));

        let typing = OutboundFrame::Typing { is_typing: true };
        let value: Value = serde_json::from_str(&typing.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "typing", "is_typing": true}));
    }

    #[test]
    fn test_inbound_chat_accepts_numeric_ids() {
        let raw = r#"{"type":"chat_message","message_id":981,"message":"yo",
            "sender":"ada","sender_id":3,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let InboundFrame::ChatMessage(chat) = InboundFrame::parse(raw).unwrap() else {
            panic!("expected chat message");
        };
        assert_eq!(chat.message_id.as_str(), "981");
        assert_eq!(chat.sender_id, "3");
        assert_eq!(chat.sender.as_deref(), Some("ada"));
    }

    #[test]
    fn test_inbound_typing_defaults() {
        let frame = InboundFrame::parse(r#"{"type":"typing","user":"ada"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Typing(TypingEvent {
                user: Some("ada".to_string()),
                is_typing: false,
            })
        );
    }

    #[test]
    fn test_inbound_rejects_unknown_and_incomplete() {
        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse(r#"{"type":"presence"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"message_id":"1"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"chat_message","message":"x"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"message_delivered","message_id":true}"#).is_err());
    }

    #[test]
    fn test_id_generator_never_repeats() {
        let mut ids = MessageIdGenerator::new();
        let a = ids.next_at(1_000);
        let b = ids.next_at(1_000);
        let c = ids.next_at(900);
        let d = ids.next_at(5_000);
        assert_eq!(a.as_str(), "1000");
        assert_eq!(b.as_str(), "1001");
        assert_eq!(c.as_str(), "1002");
        assert_eq!(d.as_str(), "5000");
    }
}
