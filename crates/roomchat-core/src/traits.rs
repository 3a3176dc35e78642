//! Transport capability consumed by the session driver.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Event reported by an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw text frame.
    Message(String),
    /// Connection closed, with the close code when one was given.
    Closed { code: Option<u16> },
    /// Connection failed. A `Closed` event may or may not follow.
    Error(String),
}

/// Stream of events for one connection.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// One established connection.
pub trait Connection: Send + 'static {
    /// Queue a text frame for sending.
    ///
    /// # Errors
    /// Returns error if the connection can no longer send.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);

    /// Whether the connection can still send. Checked before every frame; a
    /// connection that reports closed is handled as a lost connection.
    fn is_open(&self) -> bool;
}

/// Factory for connections to a URL.
///
/// `open` resolves once the handshake completes; the returned receiver then
/// yields that connection's events and nothing else.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection.
    ///
    /// # Errors
    /// Returns error if the connection cannot be established.
    async fn open(&self, url: &str) -> Result<(Self::Connection, TransportEvents), TransportError>;
}
