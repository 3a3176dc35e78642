//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for one chat room session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8000`.
    pub endpoint: String,
    /// Room name joined by this session.
    pub room: String,
    /// Identity of the local user, used to tell own messages apart.
    pub current_user_id: Option<String>,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Suppress inbound chat messages whose id was already forwarded.
    pub dedupe_inbound: bool,
    /// Number of recent inbound ids remembered for deduplication.
    pub dedupe_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000".to_string(),
            room: String::new(),
            current_user_id: None,
            reconnect: ReconnectPolicy::default(),
            dedupe_inbound: false,
            dedupe_window: 1024,
        }
    }
}

impl SessionConfig {
    /// Create a config for a room on the given endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            ..Self::default()
        }
    }

    /// Set the local user id.
    #[must_use]
    pub fn with_current_user(mut self, user_id: impl Into<String>) -> Self {
        self.current_user_id = Some(user_id.into());
        self
    }

    /// Set the reconnection policy.
    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Enable or disable inbound duplicate suppression.
    #[must_use]
    pub const fn with_dedupe_inbound(mut self, enabled: bool) -> Self {
        self.dedupe_inbound = enabled;
        self
    }

    /// WebSocket URL of the room.
    #[must_use]
    pub fn room_url(&self) -> String {
        format!("{}/ws/chat/{}/", self.endpoint.trim_end_matches('/'), self.room)
    }

    /// Check the configuration for values the session cannot work with.
    ///
    /// The room is placed verbatim in the URL path, so characters that would
    /// end or escape the path segment are rejected.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if self.room.trim().is_empty() {
            return Err(ConfigError::EmptyRoom);
        }
        if self
            .room
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
        {
            return Err(ConfigError::InvalidRoom(self.room.clone()));
        }
        if self.dedupe_inbound && self.dedupe_window == 0 {
            return Err(ConfigError::EmptyDedupeWindow);
        }
        Ok(())
    }
}

/// How long to wait between reconnection attempts, and how many to make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Attempts made before giving up.
    pub max_attempts: u32,
    /// Delay growth between attempts.
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_attempts: 5,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed-interval policy.
    #[must_use]
    pub const fn fixed(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

/// Delay growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every attempt.
    Fixed,
    /// Doubling delay, capped.
    Exponential {
        #[serde(rename = "max_delay_ms", with = "duration_ms")]
        max_delay: Duration,
    },
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url() {
        let cfg = SessionConfig::new("ws://chat.example:8000/", "lobby");
        assert_eq!(cfg.room_url(), "ws://chat.example:8000/ws/chat/lobby/");
    }

    #[test]
    fn test_default_policy_is_fixed() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(1), policy.delay_for(5));
    }

    #[test]
    fn test_partial_config_deserialization() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"room":"studio","reconnect":{"base_delay_ms":250,
                "backoff":{"kind":"exponential","max_delay_ms":1000}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.room, "studio");
        assert_eq!(cfg.endpoint, "ws://127.0.0.1:8000");
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.delay_for(1), Duration::from_millis(250));
        assert_eq!(cfg.reconnect.delay_for(3), Duration::from_millis(1000));
        assert_eq!(cfg.reconnect.delay_for(30), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            SessionConfig::new("ws://h", "").validate(),
            Err(ConfigError::EmptyRoom)
        );
        assert_eq!(
            SessionConfig::new("", "a").validate(),
            Err(ConfigError::EmptyEndpoint)
        );
        assert_eq!(
            SessionConfig::new("ws://h", "a/b").validate(),
            Err(ConfigError::InvalidRoom("a/b".to_string()))
        );
        for room in ["a?b", "a#b", "a b", "a%2F", "a\tb"] {
            assert_eq!(
                SessionConfig::new("ws://h", room).validate(),
                Err(ConfigError::InvalidRoom(room.to_string())),
                "{room:?}"
            );
        }
        tokio_test::assert_ok!(SessionConfig::new("ws://h", "studio-7_b.x").validate());
        let mut cfg = SessionConfig::new("ws://h", "a").with_dedupe_inbound(true);
        cfg.dedupe_window = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyDedupeWindow));
        tokio_test::assert_ok!(SessionConfig::new("ws://h", "a").validate());
    }
}
