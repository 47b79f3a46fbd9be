//! Server and client configuration.
//!
//! Both structs deserialize from TOML with every field optional; missing keys
//! take the documented defaults. CLI flags are layered on top in `cli.rs`.
//!
//! ```toml
//! port = 3001
//! history_capacity = 1000
//! admin_token = "change-me"
//!
//! [client]
//! max_retries = 3
//! retry_delay_ms = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::filter::DEFAULT_PROFANITY_WORDS;

/// Name of the room every session joins unless a transport picks another.
pub const DEFAULT_ROOM: &str = "general";

// ---------------------------------------------------------------------------
// ChatConfig
// ---------------------------------------------------------------------------

/// Broker and transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Interface the listener binds to.
    pub host: String,
    /// TCP port for WebSocket and polling transports.
    pub port: u16,
    /// Room used by `/ws` and `POST /poll` without an explicit room.
    pub default_room: String,
    /// Public messages kept per room; oldest evicted first.
    pub history_capacity: usize,
    /// How many of the most recent messages a joining session receives.
    pub history_replay: usize,
    /// Maximum message length, in characters.
    pub max_message_chars: usize,
    /// Maximum display-name length, in characters.
    pub max_name_chars: usize,
    /// Optional cap on live sessions per room.
    pub max_sessions: Option<usize>,
    /// When set, `join_chat{isAdmin:true}` must present this token.
    pub admin_token: Option<String>,
    /// Substrings masked with `*` in every message.
    pub profanity_words: Vec<String>,
    /// Longest time a `GET /poll/<id>` waits for events.
    pub poll_wait_ms: u64,
    /// Polling sessions idle longer than this are treated as disconnected.
    pub poll_idle_timeout_ms: u64,
    /// Defaults for clients started from the CLI.
    pub client: ClientConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            default_room: DEFAULT_ROOM.to_string(),
            history_capacity: 1000,
            history_replay: 50,
            max_message_chars: 500,
            max_name_chars: 20,
            max_sessions: None,
            admin_token: None,
            profanity_words: DEFAULT_PROFANITY_WORDS.iter().map(|w| w.to_string()).collect(),
            poll_wait_ms: 25_000,
            poll_idle_timeout_ms: 60_000,
            client: ClientConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Parse a TOML document, filling missing keys with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: ChatConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would make the broker misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "history_capacity",
                detail: "must be at least 1".into(),
            });
        }
        if self.max_message_chars == 0 {
            return Err(ConfigError::Invalid {
                field: "max_message_chars",
                detail: "must be at least 1".into(),
            });
        }
        if self.max_name_chars == 0 {
            return Err(ConfigError::Invalid {
                field: "max_name_chars",
                detail: "must be at least 1".into(),
            });
        }
        if self.default_room.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "default_room",
                detail: "must not be empty".into(),
            });
        }
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_sessions",
                detail: "must be at least 1 when set".into(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn poll_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_idle_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Reconnect and debounce settings for [`crate::client::ChatClient`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reconnect attempts after a lost connection before entering fallback.
    pub max_retries: u32,
    /// Fixed delay between reconnect attempts.
    pub retry_delay_ms: u64,
    /// A connect attempt without a handshake within this window fails.
    pub handshake_timeout_ms: u64,
    /// Idle time after the last keystroke before `typing_stop` is sent.
    pub typing_idle_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2_000,
            handshake_timeout_ms: 15_000,
            typing_idle_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.default_room, "general");
        assert_eq!(cfg.history_capacity, 1000);
        assert_eq!(cfg.history_replay, 50);
        assert_eq!(cfg.max_message_chars, 500);
        assert_eq!(cfg.max_name_chars, 20);
        assert!(cfg.max_sessions.is_none());
        assert!(cfg.admin_token.is_none());
        assert!(!cfg.profanity_words.is_empty());
    }

    #[test]
    fn client_defaults_match_documented_values() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.typing_idle(), Duration::from_secs(1));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = ChatConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.history_capacity, 1000);
        assert_eq!(cfg.client.max_retries, 3);
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let cfg = ChatConfig::from_toml_str(
            r#"
            port = 9000
            admin_token = "s3cret"
            profanity_words = ["darn"]

            [client]
            retry_delay_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(cfg.profanity_words, vec!["darn".to_string()]);
        assert_eq!(cfg.client.retry_delay(), Duration::from_millis(50));
        assert_eq!(cfg.client.max_retries, 3);
        assert_eq!(cfg.history_replay, 50);
    }

    #[test]
    fn zero_history_capacity_rejected() {
        let err = ChatConfig::from_toml_str("history_capacity = 0").unwrap_err();
        assert!(err.to_string().contains("history_capacity"), "got: {err}");
    }

    #[test]
    fn zero_max_sessions_rejected() {
        assert!(ChatConfig::from_toml_str("max_sessions = 0").is_err());
    }

    #[test]
    fn wrong_type_is_parse_error() {
        let err = ChatConfig::from_toml_str("port = \"abc\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 4444\nmax_sessions = 10").unwrap();
        let cfg = ChatConfig::load(file.path()).unwrap();
        assert_eq!(cfg.port, 4444);
        assert_eq!(cfg.max_sessions, Some(10));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ChatConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let cfg = ChatConfig { host: "0.0.0.0".into(), port: 8080, ..Default::default() };
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }
}
