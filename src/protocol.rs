//! Wire protocol: the JSON events exchanged between clients and the broker.
//!
//! Every frame is an adjacently tagged object:
//!
//! ```json
//! {"event": "send_message", "data": {"content": "hello"}}
//! {"event": "typing_start"}
//! ```
//!
//! Field names inside `data` are camelCase. The same encoding is used by the
//! WebSocket transport (one text frame per event) and by the polling
//! transport (one event per POST body, an array of events per GET reply).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Transport-assigned identifier of one live connection.
pub type ConnectionId = String;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Message id: the send timestamp plus nine random base36 characters.
pub fn generate_message_id(timestamp_ms: u64) -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("{timestamp_ms}-{suffix}")
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Public,
    Private,
}

/// A chat message. The sender name is a copy taken at send time, so stored
/// messages stay meaningful after the sender disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: ConnectionId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
}

impl Message {
    pub fn public(sender_id: &str, sender_name: &str, content: String) -> Self {
        let timestamp = now_ms();
        Self {
            id: generate_message_id(timestamp),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content,
            timestamp,
            kind: MessageKind::Public,
            recipient_id: None,
            recipient_name: None,
        }
    }

    pub fn private(
        sender_id: &str,
        sender_name: &str,
        recipient_id: &str,
        recipient_name: &str,
        content: String,
    ) -> Self {
        let timestamp = now_ms();
        Self {
            id: generate_message_id(timestamp),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            content,
            timestamp,
            kind: MessageKind::Private,
            recipient_id: Some(recipient_id.to_string()),
            recipient_name: Some(recipient_name.to_string()),
        }
    }
}

/// Presence entry in `online_users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: ConnectionId,
    pub username: String,
    pub is_admin: bool,
    pub joined_at: u64,
    pub is_typing: bool,
}

/// One abuse report, as stored in the moderation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub message_id: String,
    pub reported_by: String,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Client → broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, rename = "isAdmin")]
        is_admin: bool,
        #[serde(default, rename = "adminToken", skip_serializing_if = "Option::is_none")]
        admin_token: Option<String>,
    },
    SendMessage {
        content: String,
    },
    SendPrivateMessage {
        #[serde(rename = "recipientId")]
        recipient_id: ConnectionId,
        content: String,
    },
    ChangeUsername {
        #[serde(rename = "newUsername")]
        new_username: String,
    },
    ReportMessage {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    BlockUser {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
    },
    UnblockUser {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
    },
    GetReports,
    TypingStart,
    TypingStop,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat { .. }           => "join_chat",
            ClientEvent::SendMessage { .. }        => "send_message",
            ClientEvent::SendPrivateMessage { .. } => "send_private_message",
            ClientEvent::ChangeUsername { .. }     => "change_username",
            ClientEvent::ReportMessage { .. }      => "report_message",
            ClientEvent::BlockUser { .. }          => "block_user",
            ClientEvent::UnblockUser { .. }        => "unblock_user",
            ClientEvent::GetReports                => "get_reports",
            ClientEvent::TypingStart               => "typing_start",
            ClientEvent::TypingStop                => "typing_stop",
        }
    }
}

// ---------------------------------------------------------------------------
// Broker → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinSuccess {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
        username: String,
        #[serde(default, rename = "isAdmin")]
        is_admin: bool,
    },
    MessageHistory {
        messages: Vec<Message>,
    },
    NewMessage(Message),
    PrivateMessage(Message),
    UserJoined {
        username: String,
        #[serde(rename = "userId")]
        user_id: ConnectionId,
        timestamp: u64,
    },
    UserLeft {
        username: String,
        #[serde(rename = "userId")]
        user_id: ConnectionId,
        timestamp: u64,
    },
    UsernameChanged {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
        #[serde(rename = "oldUsername")]
        old_username: String,
        #[serde(rename = "newUsername")]
        new_username: String,
        timestamp: u64,
    },
    OnlineUsers {
        users: Vec<UserInfo>,
    },
    UserTyping {
        #[serde(rename = "userId")]
        user_id: ConnectionId,
        username: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    /// Everyone currently typing, excluding the recipient.
    TypingUsers {
        users: Vec<String>,
    },
    MessageReported {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "reportedBy")]
        reported_by: String,
        timestamp: u64,
    },
    UserBlocked {
        message: String,
    },
    UserUnblocked {
        message: String,
    },
    UsernameChangeSuccess {
        #[serde(rename = "newUsername")]
        new_username: String,
        message: String,
    },
    ReportSuccess {
        message: String,
    },
    BlockSuccess {
        message: String,
    },
    UnblockSuccess {
        message: String,
    },
    Reports {
        reports: Vec<ReportRecord>,
    },
    Error {
        message: String,
        #[serde(default)]
        code: String,
    },
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::JoinSuccess { .. }           => "join_success",
            ServerEvent::MessageHistory { .. }        => "message_history",
            ServerEvent::NewMessage(_)                => "new_message",
            ServerEvent::PrivateMessage(_)            => "private_message",
            ServerEvent::UserJoined { .. }            => "user_joined",
            ServerEvent::UserLeft { .. }              => "user_left",
            ServerEvent::UsernameChanged { .. }       => "username_changed",
            ServerEvent::OnlineUsers { .. }           => "online_users",
            ServerEvent::UserTyping { .. }            => "user_typing",
            ServerEvent::TypingUsers { .. }           => "typing_users",
            ServerEvent::MessageReported { .. }       => "message_reported",
            ServerEvent::UserBlocked { .. }           => "user_blocked",
            ServerEvent::UserUnblocked { .. }         => "user_unblocked",
            ServerEvent::UsernameChangeSuccess { .. } => "username_change_success",
            ServerEvent::ReportSuccess { .. }         => "report_success",
            ServerEvent::BlockSuccess { .. }          => "block_success",
            ServerEvent::UnblockSuccess { .. }        => "unblock_success",
            ServerEvent::Reports { .. }               => "reports",
            ServerEvent::Error { .. }                 => "error",
        }
    }
}
