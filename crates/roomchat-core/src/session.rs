//! Delivery and reconnection state machine for one chat room.
//!
//! The session performs no I/O. Each method takes one external stimulus
//! (a host call, a transport event, the reconnect timer firing) and returns
//! the [`SessionAction`]s the driver must execute, in order.
//!
//! ```text
//!  ┌──────┐ open ┌────────────┐ handshake ┌──────┐
//!  │ Idle │─────>│ Connecting │──────────>│ Open │
//!  └──────┘      └────────────┘           └──────┘
//!                  ↑        │ close          │ close
//!            timer │        ↓                ↓
//!               ┌─────────────────┐   attempts exhausted   ┌──────────────┐
//!               │ Reconnecting(n) │───────────────────────>│ Disconnected │
//!               └─────────────────┘                        └──────────────┘
//! ```
//!
//! Outbound chat messages stay in the pending table until the far end
//! acknowledges them. Every successful handshake retransmits the whole
//! table, oldest first.

use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use crate::{
    config::SessionConfig,
    error::TransportError,
    event::{ChatEvent, SessionEvent},
    pending::{PendingMessage, PendingTable},
    protocol::{InboundFrame, MessageId, MessageIdGenerator, OutboundFrame, now_millis},
};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never opened.
    Idle,
    /// Waiting for the transport handshake.
    Connecting,
    /// Handshake complete; frames flow.
    Open,
    /// Waiting to make reconnect attempt `n`.
    Reconnecting(u32),
    /// Reconnect attempts exhausted. Terminal.
    Disconnected,
    /// Torn down by the host. Terminal.
    Closed,
}

/// Work the driver must perform on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open a transport to this URL.
    Connect { url: String },
    /// Send a frame on the current transport.
    Transmit(OutboundFrame),
    /// Arm the reconnect timer.
    ScheduleReconnect { delay: Duration },
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Close the current transport.
    CloseTransport,
    /// Deliver a notification to the host.
    Notify(SessionEvent),
}

/// Chat room session state machine.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: ConnectionState,
    attempts: u32,
    pending: PendingTable,
    ids: MessageIdGenerator,
    seen: VecDeque<MessageId>,
    seen_index: HashSet<MessageId>,
}

impl Session {
    /// Create a session in [`ConnectionState::Idle`].
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            attempts: 0,
            pending: PendingTable::new(),
            ids: MessageIdGenerator::new(),
            seen: VecDeque::new(),
            seen_index: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful handshake.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingTable {
        &self.pending
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start (or restart) the connection.
    ///
    /// On an already open session this resets the attempt counter and
    /// retransmits every pending message.
    pub fn open(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Open => {
                self.attempts = 0;
                self.flush_pending(&mut actions);
            }
            ConnectionState::Idle | ConnectionState::Reconnecting(_) => {
                if matches!(self.state, ConnectionState::Reconnecting(_)) {
                    actions.push(SessionAction::CancelReconnect);
                }
                self.connect(&mut actions);
            }
            ConnectionState::Connecting => {
                tracing::debug!(room = %self.config.room, "Open requested while connecting");
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                tracing::warn!(
                    room = %self.config.room,
                    state = ?self.state,
                    "Open requested on a terminal session"
                );
            }
        }
        actions
    }

    /// The transport handshake completed.
    pub fn handle_open(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Connecting {
            tracing::debug!(state = ?self.state, "Ignoring open from stale transport");
            return actions;
        }
        tracing::info!(room = %self.config.room, pending = self.pending.len(), "Connection established");
        self.attempts = 0;
        self.transition(ConnectionState::Open, &mut actions);
        self.flush_pending(&mut actions);
        actions
    }

    /// Queue a chat message, transmitting it now if the connection is open.
    ///
    /// The message text is expected to be validated by the caller.
    pub fn send(
        &mut self,
        message: impl Into<String>,
        recipient_id: impl Into<String>,
    ) -> (MessageId, Vec<SessionAction>) {
        let id = self.ids.next_id();
        let mut actions = Vec::new();
        if self.state == ConnectionState::Closed {
            tracing::warn!(%id, "Send on a closed session discarded");
            return (id, actions);
        }

        let pending = PendingMessage {
            id: id.clone(),
            message: message.into(),
            recipient_id: recipient_id.into(),
            created_at: now_millis(),
        };
        let frame = pending.to_frame();
        self.pending.insert(pending);

        if self.state == ConnectionState::Open {
            actions.push(SessionAction::Transmit(frame));
        } else {
            tracing::debug!(%id, state = ?self.state, "Message queued until reconnect");
        }
        actions.push(SessionAction::Notify(SessionEvent::Sent(id.clone())));
        (id, actions)
    }

    /// Best-effort typing indicator; dropped unless open.
    pub fn set_typing(&mut self, is_typing: bool) -> Vec<SessionAction> {
        if self.state == ConnectionState::Open {
            vec![SessionAction::Transmit(OutboundFrame::Typing { is_typing })]
        } else {
            tracing::debug!(is_typing, "Typing indicator dropped while not open");
            Vec::new()
        }
    }

    /// A raw frame arrived on the current transport.
    pub fn handle_frame(&mut self, raw: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Closed {
            return actions;
        }

        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {e}");
                return actions;
            }
        };

        match frame {
            InboundFrame::ChatMessage(chat) => {
                // Ack before forwarding so a rendering failure cannot suppress it.
                actions.push(SessionAction::Transmit(OutboundFrame::MessageDelivered {
                    message_id: chat.message_id.clone(),
                }));
                if self.first_sighting(&chat.message_id) {
                    let event = ChatEvent::from_inbound(chat, self.config.current_user_id.as_deref());
                    actions.push(SessionAction::Notify(SessionEvent::Message(event)));
                } else {
                    tracing::debug!(id = %chat.message_id, "Duplicate inbound message suppressed");
                }
            }
            InboundFrame::Typing(typing) => {
                actions.push(SessionAction::Notify(SessionEvent::Typing(typing)));
            }
            InboundFrame::MessageDelivered { message_id } => {
                if self.pending.remove(&message_id).is_some() {
                    tracing::debug!(id = %message_id, "Message delivered");
                    actions.push(SessionAction::Notify(SessionEvent::Delivered(message_id)));
                } else {
                    tracing::debug!(id = %message_id, "Ack for unknown message ignored");
                }
            }
        }
        actions
    }

    /// The current transport closed, or failed to open.
    pub fn handle_close(&mut self, code: Option<u16>) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !matches!(self.state, ConnectionState::Open | ConnectionState::Connecting) {
            tracing::debug!(state = ?self.state, ?code, "Ignoring close outside an active connection");
            return actions;
        }

        let policy = &self.config.reconnect;
        if self.attempts < policy.max_attempts {
            self.attempts += 1;
            let delay = policy.delay_for(self.attempts);
            tracing::info!(
                room = %self.config.room,
                ?code,
                attempt = self.attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Connection closed, scheduling reconnect"
            );
            self.transition(ConnectionState::Reconnecting(self.attempts), &mut actions);
            actions.push(SessionAction::ScheduleReconnect { delay });
        } else {
            tracing::warn!(
                room = %self.config.room,
                attempts = self.attempts,
                pending = self.pending.len(),
                "Reconnect attempts exhausted"
            );
            actions.push(SessionAction::CloseTransport);
            self.transition(ConnectionState::Disconnected, &mut actions);
            actions.push(SessionAction::Notify(SessionEvent::ConnectionLost));
        }
        actions
    }

    /// Opening or sending failed. Handled as a close.
    pub fn handle_transport_failure(&mut self, err: &TransportError) -> Vec<SessionAction> {
        tracing::error!(room = %self.config.room, "Transport failure: {err}");
        self.handle_close(None)
    }

    /// The reconnect timer fired.
    pub fn reconnect_due(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if let ConnectionState::Reconnecting(attempt) = self.state {
            tracing::debug!(attempt, "Reconnecting");
            self.connect(&mut actions);
        }
        actions
    }

    /// Tear the session down, discarding pending messages.
    ///
    /// No notifications are produced by this or any later call.
    pub fn teardown(&mut self) -> Vec<SessionAction> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        if !self.pending.is_empty() {
            tracing::info!(
                discarded = self.pending.len(),
                "Session torn down with unacknowledged messages"
            );
        }
        self.pending.clear();
        self.state = ConnectionState::Closed;
        vec![SessionAction::CancelReconnect, SessionAction::CloseTransport]
    }

    fn connect(&mut self, actions: &mut Vec<SessionAction>) {
        self.transition(ConnectionState::Connecting, actions);
        actions.push(SessionAction::Connect {
            url: self.config.room_url(),
        });
    }

    fn flush_pending(&self, actions: &mut Vec<SessionAction>) {
        actions.extend(
            self.pending
                .iter()
                .map(|msg| SessionAction::Transmit(msg.to_frame())),
        );
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<SessionAction>) {
        if self.state != next {
            self.state = next;
            actions.push(SessionAction::Notify(SessionEvent::StateChanged(next)));
        }
    }

    fn first_sighting(&mut self, id: &MessageId) -> bool {
        if !self.config.dedupe_inbound {
            return true;
        }
        if !self.seen_index.insert(id.clone()) {
            return false;
        }
        self.seen.push_back(id.clone());
        while self.seen.len() > self.config.dedupe_window.max(1) {
            if let Some(old) = self.seen.pop_front() {
                self.seen_index.remove(&old);
            }
        }
        true
    }
}
