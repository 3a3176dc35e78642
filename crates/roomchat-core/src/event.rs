//! Session notifications and host callbacks.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    protocol::{InboundChat, MessageId, TypingEvent},
    session::ConnectionState,
};

/// Whether a chat message was authored by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// Decoded inbound chat message, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEvent {
    pub message_id: MessageId,
    pub message: String,
    pub sender_id: String,
    pub sender: Option<String>,
    pub timestamp: String,
    pub direction: Direction,
}

impl ChatEvent {
    /// Decode a wire payload relative to the local user.
    #[must_use]
    pub fn from_inbound(chat: InboundChat, current_user_id: Option<&str>) -> Self {
        let direction = if current_user_id == Some(chat.sender_id.as_str()) {
            Direction::Sent
        } else {
            Direction::Received
        };
        Self {
            message_id: chat.message_id,
            message: chat.message,
            sender_id: chat.sender_id,
            sender: chat.sender,
            timestamp: chat.timestamp,
            direction,
        }
    }
}

/// Notification emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message(ChatEvent),
    Delivered(MessageId),
    Sent(MessageId),
    Typing(TypingEvent),
    ConnectionLost,
    StateChanged(ConnectionState),
}

/// Host-side callbacks.
///
/// Every method defaults to a no-op so hosts implement only what they render.
/// Callbacks run on the session's task; they must not block.
pub trait SessionCallbacks: Send + 'static {
    fn on_message(&mut self, _event: &ChatEvent) {}

    fn on_delivered(&mut self, _id: &MessageId) {}

    /// A message was accepted and is pending acknowledgment.
    fn on_sent(&mut self, _id: &MessageId) {}

    fn on_typing(&mut self, _event: &TypingEvent) {}

    /// Reconnection gave up. Fires at most once per session.
    fn on_connection_lost(&mut self) {}

    fn on_state_change(&mut self, _state: ConnectionState) {}

    /// Route an event to the matching callback.
    fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Message(chat) => self.on_message(&chat),
            SessionEvent::Delivered(id) => self.on_delivered(&id),
            SessionEvent::Sent(id) => self.on_sent(&id),
            SessionEvent::Typing(typing) => self.on_typing(&typing),
            SessionEvent::ConnectionLost => self.on_connection_lost(),
            SessionEvent::StateChanged(state) => self.on_state_change(state),
        }
    }
}

/// Callbacks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {}

/// Callbacks that forward every event into a channel.
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelCallbacks {
    /// Create the callbacks and the receiving end of their channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionCallbacks for ChannelCallbacks {
    fn dispatch(&mut self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Session event receiver dropped");
        }
    }
}
