//! Core abstractions for room chat sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `protocol` - JSON wire frames and message ids
//! - `Session` - Delivery and reconnection state machine (no I/O)
//! - `PendingTable` - Unacknowledged outbound messages, in send order
//! - `SessionConfig` - Room, identity and reconnect policy
//! - Transport and callback traits

pub mod config;
pub mod error;
pub mod event;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod traits;

pub use config::{Backoff, ReconnectPolicy, SessionConfig};
pub use error::{ConfigError, FrameError, TransportError};
pub use event::{ChannelCallbacks, ChatEvent, Direction, NoopCallbacks, SessionCallbacks, SessionEvent};
pub use pending::{PendingMessage, PendingTable};
pub use protocol::{InboundFrame, MessageId, OutboundFrame, TypingEvent};
pub use session::{ConnectionState, Session, SessionAction};
pub use traits::{Connection, Transport, TransportEvent, TransportEvents};
