//! Transports for room chat sessions.
//!
//! Provides:
//! - WebSocket client transport (feature: websocket)
//! - Scripted in-memory transport for tests (feature: memory)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

#[cfg(any(test, feature = "memory"))]
pub use memory::{MemoryConnection, MemoryServer, MemoryTransport};
