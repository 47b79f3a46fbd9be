use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use colored::*;

use crate::client::{ChatEvent, ClientOptions, ConnectionState};
use crate::config::{ChatConfig, ClientConfig};
use crate::error::ConfigError;
use crate::protocol::ServerEvent;

#[derive(Parser)]
#[command(name = "tavern-chat")]
#[command(version)]
#[command(about = "Real-time chat broker and reconnecting terminal client for the tavern RPG")]
pub struct Cli {
    /// Log filter (e.g. `debug`, `tavern_chat=trace`); overrides RUST_LOG
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the chat server (WebSocket + long-poll)
    Serve(ServeArgs),
    /// Connect an interactive terminal client to a server
    Connect(ConnectArgs),
    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Public messages kept per room
    #[arg(long)]
    pub history_capacity: Option<usize>,

    /// Maximum live sessions per room
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Token required to join as admin
    #[arg(long)]
    pub admin_token: Option<String>,
}

impl ServeArgs {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn resolve(&self) -> Result<ChatConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ChatConfig::load(path)?,
            None => ChatConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(cap) = self.history_capacity {
            config.history_capacity = cap;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = Some(max);
        }
        if let Some(token) = &self.admin_token {
            config.admin_token = Some(token.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Server URL: ws://host:port[/ws/<room>] or http://host:port
    #[arg(long, default_value = "ws://127.0.0.1:3001/ws")]
    pub url: String,

    /// Display name (random if omitted)
    #[arg(long, short)]
    pub name: Option<String>,

    /// Request admin rights
    #[arg(long)]
    pub admin: bool,

    /// Admin token, if the server requires one
    #[arg(long)]
    pub admin_token: Option<String>,

    /// TOML config file; only the `[client]` table is used
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl ConnectArgs {
    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        let config = match &self.config {
            Some(path) => ChatConfig::load(path)?.client,
            None => ClientConfig::default(),
        };
        Ok(ClientOptions {
            username: self.name.clone(),
            is_admin: self.admin,
            admin_token: self.admin_token.clone(),
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Terminal client input
// ---------------------------------------------------------------------------

pub const HELP: &str = "\
  /nick <name>          change display name
  /msg <userId> <text>  private message
  /report <messageId>   report a message
  /block <userId>       block a user (admin)
  /unblock <userId>     unblock a user (admin)
  /reports              list reports (admin)
  /reconnect            reconnect after going offline
  /quit                 leave";

/// One line typed into the terminal client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Say(String),
    Nick(String),
    Msg { to: String, text: String },
    Report(String),
    Block(String),
    Unblock(String),
    Reports,
    Reconnect,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Say(line.to_string());
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    let need = |usage: &str, make: fn(String) -> Input| {
        if arg.is_empty() {
            Input::Invalid(format!("usage: {usage}"))
        } else {
            make(arg.to_string())
        }
    };
    match cmd {
        "nick" => need("/nick <name>", Input::Nick),
        "report" => need("/report <messageId>", Input::Report),
        "block" => need("/block <userId>", Input::Block),
        "unblock" => need("/unblock <userId>", Input::Unblock),
        "msg" => match arg.split_once(char::is_whitespace) {
            Some((to, text)) if !text.trim().is_empty() => Input::Msg {
                to: to.to_string(),
                text: text.trim().to_string(),
            },
            _ => Input::Invalid("usage: /msg <userId> <text>".to_string()),
        },
        "reports" => Input::Reports,
        "reconnect" => Input::Reconnect,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other} (try /help)")),
    }
}

/// Terminal rendering of a client event; `None` for events not shown.
pub fn render_event(event: &ChatEvent) -> Option<String> {
    let line = match event {
        ChatEvent::Status(state) => match state {
            ConnectionState::Connected => "* connected".bright_green().to_string(),
            ConnectionState::Connecting => "* connecting...".bright_blue().to_string(),
            ConnectionState::Disconnected => "* connection lost, retrying".yellow().to_string(),
            ConnectionState::Error => return None,
            ConnectionState::Fallback => "* offline; type /reconnect to try again".bright_red().to_string(),
        },
        ChatEvent::Server(event) => match event {
            ServerEvent::JoinSuccess { username, user_id, is_admin } => {
                let role = if *is_admin { " (admin)" } else { "" };
                format!("* joined as {}{role} [{user_id}]", username.bold()).bright_green().to_string()
            }
            ServerEvent::MessageHistory { messages } => {
                let mut out = format!("* {} earlier messages", messages.len()).dimmed().to_string();
                for m in messages {
                    out.push('\n');
                    out.push_str(&format!("{} {}", format!("<{}>", m.sender_name).cyan(), m.content));
                }
                out
            }
            ServerEvent::NewMessage(m) => {
                format!("{} {} {}", format!("<{}>", m.sender_name).cyan(), m.content, format!("#{}", m.id).dimmed())
            }
            ServerEvent::PrivateMessage(m) => format!(
                "{} {}",
                format!("[pm {} -> {}]", m.sender_name, m.recipient_name.as_deref().unwrap_or("?")).magenta(),
                m.content
            ),
            ServerEvent::UserJoined { username, .. } => format!("* {username} joined").dimmed().to_string(),
            ServerEvent::UserLeft { username, .. } => format!("* {username} left").dimmed().to_string(),
            ServerEvent::UsernameChanged { old_username, new_username, .. } => {
                format!("* {old_username} is now {new_username}").dimmed().to_string()
            }
            ServerEvent::OnlineUsers { users } => {
                let names: Vec<String> = users
                    .iter()
                    .map(|u| format!("{} [{}]", u.username, u.user_id))
                    .collect();
                format!("* online: {}", names.join(", ")).dimmed().to_string()
            }
            ServerEvent::TypingUsers { users } if users.is_empty() => return None,
            ServerEvent::TypingUsers { users } => {
                format!("* {} typing...", users.join(", ")).dimmed().to_string()
            }
            ServerEvent::UserTyping { .. } => return None,
            ServerEvent::MessageReported { message_id, reported_by, .. } => {
                format!("! {reported_by} reported message {message_id}").yellow().to_string()
            }
            ServerEvent::Reports { reports } => {
                let mut out = format!("* {} reports", reports.len());
                for r in reports {
                    out.push_str(&format!("\n  {} by {}", r.message_id, r.reported_by));
                }
                out.yellow().to_string()
            }
            ServerEvent::UserBlocked { message } | ServerEvent::UserUnblocked { message } => {
                format!("! {message}").yellow().to_string()
            }
            ServerEvent::UsernameChangeSuccess { message, .. }
            | ServerEvent::ReportSuccess { message }
            | ServerEvent::BlockSuccess { message }
            | ServerEvent::UnblockSuccess { message } => format!("* {message}").green().to_string(),
            ServerEvent::Error { message, .. } => format!("! {message}").bright_red().to_string(),
        },
    };
    Some(line)
}
