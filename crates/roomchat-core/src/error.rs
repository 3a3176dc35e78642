//! Error types.

use thiserror::Error;

/// Frame codec error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Connection closed")]
    Closed,
    #[error("Connection failed: {0}")]
    Failed(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Endpoint must not be empty")]
    EmptyEndpoint,
    #[error("Room must not be empty")]
    EmptyRoom,
    #[error("Room name is not a valid URL path segment: {0}")]
    InvalidRoom(String),
    #[error("Dedupe window must be at least 1")]
    EmptyDedupeWindow,
}
