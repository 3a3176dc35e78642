//! Session driver for room chat.
//!
//! Provides:
//! - `ChatClient` - Runs a `Session` against a `Transport` on its own task
//! - `EventStream` - Session events as a `Stream`

pub mod client;

pub use client::{ChatClient, ClientError, ClientStatus, EventStream};
