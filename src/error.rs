//! Error types for every layer of the chat service.
//!
//! [`ChatError`] is the broker-side taxonomy. Every variant is recoverable and
//! is reported only to the connection that caused it, as an `error` event
//! carrying [`ChatError::code`]. Transport failures never show up here; the
//! client turns them into connection-state changes instead.

use std::fmt;

use thiserror::Error;

use crate::client::ConnectionState;

/// Broad category of a [`ChatError`], used for logging and by UIs that only
/// care about the class of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Empty or oversized content / name.
    Validation,
    /// Caller lacks the privilege for the action.
    Authorization,
    /// Unknown recipient or target.
    NotFound,
    /// Name already held by another live session.
    Conflict,
    /// Sender is in the blocked set.
    Moderation,
    /// Room is at its session cap.
    Capacity,
    /// Event out of sequence for this connection (e.g. not joined yet).
    Protocol,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation    => "validation",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::NotFound      => "not_found",
            ErrorCategory::Conflict      => "conflict",
            ErrorCategory::Moderation    => "moderation",
            ErrorCategory::Capacity      => "capacity",
            ErrorCategory::Protocol      => "protocol",
        };
        write!(f, "{s}")
    }
}

/// A rejected chat operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("You are blocked from sending messages")]
    Blocked,

    #[error("Message cannot be empty")]
    EmptyContent,

    #[error("Message is too long (max {max} characters)")]
    TooLong { max: usize },

    #[error("Username cannot be empty")]
    EmptyName,

    #[error("Username is too long (max {max} characters)")]
    NameTooLong { max: usize },

    #[error("Username '{name}' is already taken")]
    NameTaken { name: String },

    #[error("Admins cannot change their username")]
    AdminCannotRename,

    #[error("Only admins can perform this action")]
    NotAdmin,

    #[error("Recipient not found")]
    RecipientNotFound,

    #[error("User not found")]
    TargetNotFound,

    #[error("Join the chat first")]
    NotJoined,

    #[error("Already joined")]
    AlreadyJoined,

    #[error("Chat room is full (max {max} users)")]
    TooManySessions { max: usize },
}

impl ChatError {
    /// Stable snake_case identifier sent alongside the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Blocked              => "blocked",
            ChatError::EmptyContent         => "empty_content",
            ChatError::TooLong { .. }       => "too_long",
            ChatError::EmptyName            => "empty_name",
            ChatError::NameTooLong { .. }   => "name_too_long",
            ChatError::NameTaken { .. }     => "name_taken",
            ChatError::AdminCannotRename    => "admin_cannot_rename",
            ChatError::NotAdmin             => "not_admin",
            ChatError::RecipientNotFound    => "recipient_not_found",
            ChatError::TargetNotFound       => "target_not_found",
            ChatError::NotJoined            => "not_joined",
            ChatError::AlreadyJoined        => "already_joined",
            ChatError::TooManySessions { .. } => "too_many_sessions",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::EmptyContent
            | ChatError::TooLong { .. }
            | ChatError::EmptyName
            | ChatError::NameTooLong { .. } => ErrorCategory::Validation,
            ChatError::AdminCannotRename | ChatError::NotAdmin => ErrorCategory::Authorization,
            ChatError::RecipientNotFound | ChatError::TargetNotFound => ErrorCategory::NotFound,
            ChatError::NameTaken { .. } => ErrorCategory::Conflict,
            ChatError::Blocked => ErrorCategory::Moderation,
            ChatError::TooManySessions { .. } => ErrorCategory::Capacity,
            ChatError::NotJoined | ChatError::AlreadyJoined => ErrorCategory::Protocol,
        }
    }
}

/// Failure to load or parse a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },
}

/// Client-side failures. Operations attempted outside `connected` fail
/// locally with [`ClientError::NotConnected`] instead of waiting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("client is shut down")]
    Closed,
}

/// Errors from the network-facing server plumbing.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("malformed HTTP request: {0}")]
    Http(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<httparse::Error> for ServerError {
    fn from(e: httparse::Error) -> Self {
        ServerError::Http(e.to_string())
    }
}
