//! Real-time chat for the tavern RPG: an in-memory room broker, WebSocket and
//! long-poll transports, and a reconnecting client.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tavern_chat::{ChatBroker, ChatConfig};
//! use tavern_chat::client::{ChatClient, ClientOptions, LocalConnector};
//!
//! # async fn demo() {
//! let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
//! let client = ChatClient::start(
//!     LocalConnector::new(broker, "general"),
//!     ClientOptions { username: Some("Alice".into()), ..Default::default() },
//! );
//! client.subscribe(|event| println!("{event:?}"));
//! # }
//! ```

pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod history;
pub mod moderation;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;

pub use broker::{BrokerConnection, ChatBroker};
pub use config::{ChatConfig, ClientConfig};
pub use error::{ChatError, ClientError, ConfigError, ErrorCategory, ServerError};
pub use protocol::{ClientEvent, Message, MessageKind, ServerEvent, UserInfo};
pub use room::{Room, RoomHandle, RoomSnapshot};
pub use server::{serve, ChatServer};
