//! Chat room: session registry, moderation, history and fan-out for one room.
//!
//! ## Design
//! - [`Room`] owns all mutable chat state for one room and is never shared.
//! - [`run_room`] is the room's actor: a single tokio task that drains
//!   [`RoomCommand`]s from an unbounded mpsc channel and applies each one to
//!   completion (state mutation + outbound fan-out) before the next. That
//!   gives every room-visible event a total order without any locks.
//! - Each connection has its own outbox (`mpsc::UnboundedSender<ServerEvent>`);
//!   the room pushes events into outboxes and the connection task writes them
//!   to the wire.
//! - Every operation validates fully before mutating anything.
//!
//! ## Connection lifecycle
//! 1. Transport accepts a connection → `Attach` registers its outbox.
//! 2. `join_chat` → session created, history + presence sent to the caller,
//!    `user_joined` to everyone else.
//! 3. Client events are applied in arrival order at the room task.
//! 4. Transport drops → `Detach` → session removed, `user_left` broadcast.
//! 5. A room spawned with a [`RoomDirectory`] removes itself from it and
//!    stops once the last connection detaches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::filter::ProfanityFilter;
use crate::history::MessageHistory;
use crate::moderation::ModerationState;
use crate::protocol::{now_ms, ClientEvent, ConnectionId, Message, ReportRecord, ServerEvent, UserInfo};
use crate::session::{generate_username, Session, SessionRegistry};

/// Per-connection queue of outbound events.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Room name → running actor, shared between the broker and the actors it
/// spawned.
pub type RoomDirectory = Arc<Mutex<HashMap<String, RoomHandle>>>;

/// Name used in report records when the reporter never joined.
const ANONYMOUS_REPORTER: &str = "anonymous";

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

pub struct Room {
    name: String,
    registry: SessionRegistry,
    moderation: ModerationState,
    history: MessageHistory,
    /// Attached connections, joined or not.
    outboxes: HashMap<ConnectionId, Outbox>,
    filter: ProfanityFilter,
    history_replay: usize,
    max_message_chars: usize,
    max_name_chars: usize,
    max_sessions: Option<usize>,
    admin_token: Option<String>,
}

impl Room {
    pub fn new(name: impl Into<String>, config: &ChatConfig) -> Self {
        Self {
            name: name.into(),
            registry: SessionRegistry::new(),
            moderation: ModerationState::new(),
            history: MessageHistory::new(config.history_capacity),
            outboxes: HashMap::new(),
            filter: ProfanityFilter::new(&config.profanity_words),
            history_replay: config.history_replay,
            max_message_chars: config.max_message_chars,
            max_name_chars: config.max_name_chars,
            max_sessions: config.max_sessions,
            admin_token: config.admin_token.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.registry.get(id)
    }

    pub fn member_count(&self) -> usize {
        self.registry.len()
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.registry.users()
    }

    pub fn history(&self) -> &MessageHistory {
        &self.history
    }

    pub fn moderation(&self) -> &ModerationState {
        &self.moderation
    }

    /// Everyone whose typing flag is currently set, in join order.
    pub fn typing_names(&self) -> Vec<String> {
        self.registry.typing_names(None)
    }

    /// No attached connections and no sessions.
    pub fn is_idle(&self) -> bool {
        self.outboxes.is_empty() && self.registry.is_empty()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            name: self.name.clone(),
            users: self.registry.users(),
            history_len: self.history.len(),
            blocked_count: self.moderation.blocked_count(),
            reports: self.moderation.reports().to_vec(),
            typing: self.typing_names(),
        }
    }

    // -----------------------------------------------------------------------
    // Connection attachment
    // -----------------------------------------------------------------------

    /// Register the outbox of a freshly accepted connection.
    pub fn attach(&mut self, conn: &str, outbox: Outbox) {
        debug!(room = %self.name, conn = %conn, "connection attached");
        self.outboxes.insert(conn.to_string(), outbox);
    }

    /// Drop a connection: leave (if joined) and forget its outbox.
    pub fn detach(&mut self, conn: &str) {
        self.leave(conn);
        self.outboxes.remove(conn);
        debug!(room = %self.name, conn = %conn, "connection detached");
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Create a session for `conn`. An empty name gets a generated one;
    /// duplicate names are accepted here.
    pub fn join(
        &mut self,
        conn: &str,
        requested_name: Option<&str>,
        is_admin: bool,
        admin_token: Option<&str>,
    ) -> Result<Session, ChatError> {
        if self.registry.contains(conn) {
            return Err(ChatError::AlreadyJoined);
        }
        if let Some(max) = self.max_sessions {
            if self.registry.len() >= max {
                return Err(ChatError::TooManySessions { max });
            }
        }

        let username = requested_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| n.chars().take(self.max_name_chars).collect::<String>())
            .unwrap_or_else(generate_username);

        let is_admin = is_admin && self.admin_granted(conn, admin_token);
        let session = Session::new(conn, username, is_admin);
        self.registry.insert(session.clone());

        info!(
            room = %self.name,
            conn = %conn,
            username = %session.username,
            is_admin,
            members = self.registry.len(),
            "session joined"
        );

        self.send_to(
            conn,
            ServerEvent::JoinSuccess {
                user_id: session.id.clone(),
                username: session.username.clone(),
                is_admin: session.is_admin,
            },
        );
        self.send_to(
            conn,
            ServerEvent::MessageHistory {
                messages: self.history.recent(self.history_replay),
            },
        );
        self.send_to(conn, ServerEvent::OnlineUsers { users: self.registry.users() });
        let typing = self.registry.typing_names(Some(conn));
        if !typing.is_empty() {
            self.send_to(conn, ServerEvent::TypingUsers { users: typing });
        }

        self.broadcast_except(
            conn,
            ServerEvent::UserJoined {
                username: session.username.clone(),
                user_id: session.id.clone(),
                timestamp: session.joined_at,
            },
        );
        self.broadcast_except(conn, ServerEvent::OnlineUsers { users: self.registry.users() });

        Ok(session)
    }

    /// Validate, filter, store and broadcast a public message.
    pub fn send_public(&mut self, conn: &str, content: &str) -> Result<Message, ChatError> {
        let sender = self.registry.get(conn).ok_or(ChatError::NotJoined)?;
        if self.moderation.is_blocked(conn) {
            return Err(ChatError::Blocked);
        }
        let content = self.validate_content(content)?;

        let message = Message::public(&sender.id, &sender.username, self.filter.clean(content));
        self.history.push(message.clone());
        let was_typing = match self.registry.get_mut(conn) {
            Some(s) => {
                s.touch();
                std::mem::replace(&mut s.is_typing, false)
            }
            None => false,
        };

        debug!(room = %self.name, conn = %conn, message_id = %message.id, "public message");
        self.broadcast(ServerEvent::NewMessage(message.clone()));
        if was_typing {
            self.broadcast_typing(conn);
        }
        Ok(message)
    }

    /// Deliver a message to sender and recipient only; never stored.
    pub fn send_private(
        &mut self,
        conn: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        let sender = self.registry.get(conn).ok_or(ChatError::NotJoined)?;
        if self.moderation.is_blocked(conn) {
            return Err(ChatError::Blocked);
        }
        let recipient = self.registry.get(recipient_id).ok_or(ChatError::RecipientNotFound)?;
        let content = self.validate_content(content)?;

        let message = Message::private(
            &sender.id,
            &sender.username,
            &recipient.id,
            &recipient.username,
            self.filter.clean(content),
        );
        if let Some(s) = self.registry.get_mut(conn) {
            s.touch();
        }

        debug!(room = %self.name, conn = %conn, recipient = %recipient_id, "private message");
        self.send_to(conn, ServerEvent::PrivateMessage(message.clone()));
        if recipient_id != conn {
            self.send_to(recipient_id, ServerEvent::PrivateMessage(message.clone()));
        }
        Ok(message)
    }

    /// Rename a non-admin session. Returns the previous name.
    pub fn change_username(&mut self, conn: &str, new_name: &str) -> Result<String, ChatError> {
        let session = self.registry.get(conn).ok_or(ChatError::NotJoined)?;
        if session.is_admin {
            return Err(ChatError::AdminCannotRename);
        }
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ChatError::EmptyName);
        }
        if new_name.chars().count() > self.max_name_chars {
            return Err(ChatError::NameTooLong { max: self.max_name_chars });
        }
        if self.registry.name_taken(new_name, conn) {
            return Err(ChatError::NameTaken { name: new_name.to_string() });
        }

        let (old_name, is_typing) = match self.registry.get_mut(conn) {
            Some(s) => {
                s.touch();
                (std::mem::replace(&mut s.username, new_name.to_string()), s.is_typing)
            }
            None => return Err(ChatError::NotJoined),
        };

        info!(room = %self.name, conn = %conn, old = %old_name, new = %new_name, "username changed");
        self.broadcast(ServerEvent::UsernameChanged {
            user_id: conn.to_string(),
            old_username: old_name.clone(),
            new_username: new_name.to_string(),
            timestamp: now_ms(),
        });
        self.send_to(
            conn,
            ServerEvent::UsernameChangeSuccess {
                new_username: new_name.to_string(),
                message: format!("Username changed to {new_name}"),
            },
        );
        self.broadcast(ServerEvent::OnlineUsers { users: self.registry.users() });
        if is_typing {
            self.broadcast_typing(conn);
        }
        Ok(old_name)
    }

    /// Log a report and notify every admin. Never fails.
    pub fn report_message(&mut self, conn: &str, message_id: &str) -> ReportRecord {
        let reporter = self
            .registry
            .get(conn)
            .map(|s| s.username.clone())
            .unwrap_or_else(|| ANONYMOUS_REPORTER.to_string());
        let record = self.moderation.record_report(message_id, &reporter);

        info!(room = %self.name, conn = %conn, message_id = %message_id, reporter = %reporter, "message reported");
        for admin in self.registry.admin_ids() {
            self.send_to(
                &admin,
                ServerEvent::MessageReported {
                    message_id: record.message_id.clone(),
                    reported_by: record.reported_by.clone(),
                    timestamp: record.timestamp,
                },
            );
        }
        self.send_to(
            conn,
            ServerEvent::ReportSuccess {
                message: "Message reported. An admin will review it.".to_string(),
            },
        );
        record
    }

    /// Admin-only: add `target` to the blocked set.
    pub fn block(&mut self, conn: &str, target: &str) -> Result<(), ChatError> {
        self.require_admin(conn)?;
        let target_name = self
            .registry
            .get(target)
            .map(|s| s.username.clone())
            .ok_or(ChatError::TargetNotFound)?;

        self.moderation.block(target);
        warn!(room = %self.name, admin = %conn, target = %target, "session blocked");
        self.send_to(
            target,
            ServerEvent::UserBlocked {
                message: "You have been blocked by an admin".to_string(),
            },
        );
        self.send_to(
            conn,
            ServerEvent::BlockSuccess {
                message: format!("{target_name} has been blocked"),
            },
        );
        Ok(())
    }

    /// Admin-only: clear a block. The target may have disconnected already.
    pub fn unblock(&mut self, conn: &str, target: &str) -> Result<(), ChatError> {
        self.require_admin(conn)?;
        if !self.moderation.is_blocked(target) {
            return Err(ChatError::TargetNotFound);
        }

        self.moderation.unblock(target);
        info!(room = %self.name, admin = %conn, target = %target, "session unblocked");
        let target_name = self.registry.get(target).map(|s| s.username.clone());
        if target_name.is_some() {
            self.send_to(
                target,
                ServerEvent::UserUnblocked {
                    message: "You have been unblocked".to_string(),
                },
            );
        }
        self.send_to(
            conn,
            ServerEvent::UnblockSuccess {
                message: format!("{} has been unblocked", target_name.as_deref().unwrap_or(target)),
            },
        );
        Ok(())
    }

    /// Admin-only: send the report log to the caller.
    pub fn list_reports(&mut self, conn: &str) -> Result<Vec<ReportRecord>, ChatError> {
        self.require_admin(conn)?;
        let reports = self.moderation.reports().to_vec();
        self.send_to(conn, ServerEvent::Reports { reports: reports.clone() });
        Ok(reports)
    }

    /// Update the typing flag and fan out the change. Repeating the current
    /// state is a no-op.
    pub fn set_typing(&mut self, conn: &str, is_typing: bool) -> Result<(), ChatError> {
        let session = self.registry.get_mut(conn).ok_or(ChatError::NotJoined)?;
        if session.is_typing == is_typing {
            return Ok(());
        }
        session.is_typing = is_typing;
        session.touch();
        self.broadcast_typing(conn);
        Ok(())
    }

    /// Remove a session. The blocked set is left untouched.
    pub fn leave(&mut self, conn: &str) -> Option<Session> {
        let session = self.registry.remove(conn)?;
        info!(
            room = %self.name,
            conn = %conn,
            username = %session.username,
            members = self.registry.len(),
            "session left"
        );
        self.broadcast(ServerEvent::UserLeft {
            username: session.username.clone(),
            user_id: session.id.clone(),
            timestamp: now_ms(),
        });
        self.broadcast(ServerEvent::OnlineUsers { users: self.registry.users() });
        if session.is_typing {
            self.broadcast(ServerEvent::UserTyping {
                user_id: session.id.clone(),
                username: session.username.clone(),
                is_typing: false,
            });
            self.broadcast_typing_lists();
        }
        Some(session)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Apply one client event; failures go back to the caller as `error`.
    pub fn handle(&mut self, conn: &str, event: ClientEvent) {
        let name = event.name();
        let result = match event {
            ClientEvent::JoinChat { username, is_admin, admin_token } => self
                .join(conn, username.as_deref(), is_admin, admin_token.as_deref())
                .map(|_| ()),
            ClientEvent::SendMessage { content } => self.send_public(conn, &content).map(|_| ()),
            ClientEvent::SendPrivateMessage { recipient_id, content } => {
                self.send_private(conn, &recipient_id, &content).map(|_| ())
            }
            ClientEvent::ChangeUsername { new_username } => {
                self.change_username(conn, &new_username).map(|_| ())
            }
            ClientEvent::ReportMessage { message_id } => {
                self.report_message(conn, &message_id);
                Ok(())
            }
            ClientEvent::BlockUser { user_id } => self.block(conn, &user_id),
            ClientEvent::UnblockUser { user_id } => self.unblock(conn, &user_id),
            ClientEvent::GetReports => self.list_reports(conn).map(|_| ()),
            ClientEvent::TypingStart => self.set_typing(conn, true),
            ClientEvent::TypingStop => self.set_typing(conn, false),
        };

        if let Err(e) = result {
            warn!(
                room = %self.name,
                conn = %conn,
                event = name,
                category = %e.category(),
                error = %e,
                "event rejected"
            );
            self.send_to(conn, ServerEvent::error(&e));
        }
    }

    /// Apply one actor command.
    pub fn apply(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Attach { conn, outbox } => self.attach(&conn, outbox),
            RoomCommand::Client { conn, event } => self.handle(&conn, event),
            RoomCommand::Detach { conn } => self.detach(&conn),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if content.chars().count() > self.max_message_chars {
            return Err(ChatError::TooLong { max: self.max_message_chars });
        }
        Ok(content)
    }

    fn require_admin(&self, conn: &str) -> Result<(), ChatError> {
        match self.registry.get(conn) {
            None => Err(ChatError::NotJoined),
            Some(s) if !s.is_admin => Err(ChatError::NotAdmin),
            Some(_) => Ok(()),
        }
    }

    fn admin_granted(&self, conn: &str, presented: Option<&str>) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return true;
        };
        let granted = presented
            .map(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())))
            .unwrap_or(false);
        if !granted {
            warn!(room = %self.name, conn = %conn, "admin requested without a valid token; joining as user");
        }
        granted
    }

    fn send_to(&self, conn: &str, event: ServerEvent) {
        if let Some(outbox) = self.outboxes.get(conn) {
            if outbox.send(event).is_err() {
                debug!(room = %self.name, conn = %conn, "outbox closed; dropping event");
            }
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        for id in self.registry.ids() {
            self.send_to(&id, event.clone());
        }
    }

    fn broadcast_except(&self, except: &str, event: ServerEvent) {
        for id in self.registry.ids() {
            if id != except {
                self.send_to(&id, event.clone());
            }
        }
    }

    /// Announce `typist`'s current flag to everyone else, then refresh every
    /// member's aggregated typing list.
    fn broadcast_typing(&self, typist: &str) {
        if let Some(s) = self.registry.get(typist) {
            self.broadcast_except(
                typist,
                ServerEvent::UserTyping {
                    user_id: s.id.clone(),
                    username: s.username.clone(),
                    is_typing: s.is_typing,
                },
            );
        }
        self.broadcast_typing_lists();
    }

    fn broadcast_typing_lists(&self) {
        let typists = self.registry.typists();
        for id in self.registry.ids() {
            let users = typists
                .iter()
                .filter(|(typist, _)| *typist != id)
                .map(|(_, name)| name.to_string())
                .collect();
            self.send_to(&id, ServerEvent::TypingUsers { users });
        }
    }
}

/// Read-only view of a room, for admin tooling and tests.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub name: String,
    pub users: Vec<UserInfo>,
    pub history_len: usize,
    pub blocked_count: usize,
    pub reports: Vec<ReportRecord>,
    pub typing: Vec<String>,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Commands processed by a room's actor task, strictly in order.
#[derive(Debug)]
pub enum RoomCommand {
    Attach { conn: ConnectionId, outbox: Outbox },
    Client { conn: ConnectionId, event: ClientEvent },
    Detach { conn: ConnectionId },
    Inspect { reply: oneshot::Sender<RoomSnapshot> },
}

/// Cloneable handle to a running room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Spawn the actor task for `room` on the current tokio runtime. The
    /// room runs until every handle is dropped.
    pub fn spawn(room: Room) -> Self {
        Self::spawn_with(room, None)
    }

    /// Like [`RoomHandle::spawn`], but the room deletes its own entry from
    /// `directory` and stops as soon as it goes idle after a detach.
    /// Callers must hold the `directory` lock while attaching to the handle.
    pub fn spawn_reaped(room: Room, directory: RoomDirectory) -> Self {
        Self::spawn_with(room, Some(directory))
    }

    fn spawn_with(room: Room, directory: Option<RoomDirectory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = room.name().to_string();
        tokio::spawn(run_room(room, rx, directory));
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` if the room task has stopped.
    pub fn attach(&self, conn: &str, outbox: Outbox) -> bool {
        self.tx
            .send(RoomCommand::Attach { conn: conn.to_string(), outbox })
            .is_ok()
    }

    pub fn dispatch(&self, conn: &str, event: ClientEvent) -> bool {
        self.tx
            .send(RoomCommand::Client { conn: conn.to_string(), event })
            .is_ok()
    }

    pub fn detach(&self, conn: &str) {
        let _ = self.tx.send(RoomCommand::Detach { conn: conn.to_string() });
    }

    /// Snapshot taken after every previously queued command has been applied.
    pub async fn snapshot(&self) -> Option<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RoomCommand::Inspect { reply }).ok()?;
        rx.await.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Actor loop: apply commands one at a time until every handle is dropped,
/// or, with a `directory`, until the room goes idle.
pub async fn run_room(
    mut room: Room,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    directory: Option<RoomDirectory>,
) {
    info!(room = %room.name, "room started");
    while let Some(command) = rx.recv().await {
        let detach = matches!(command, RoomCommand::Detach { .. });
        room.apply(command);
        if let Some(directory) = directory.as_ref().filter(|_| detach && room.is_idle()) {
            if retire(&mut room, &mut rx, directory) {
                break;
            }
        }
    }
    info!(room = %room.name, "room stopped");
}

/// Drop an idle room from `directory`. Commands already queued are applied
/// first; returns `false` if one of them made the room busy again.
fn retire(
    room: &mut Room,
    rx: &mut mpsc::UnboundedReceiver<RoomCommand>,
    directory: &RoomDirectory,
) -> bool {
    loop {
        let mut rooms = directory.lock().unwrap_or_else(|p| p.into_inner());
        match rx.try_recv() {
            Ok(command) => {
                drop(rooms);
                room.apply(command);
                if !room.is_idle() {
                    return false;
                }
            }
            Err(_) => {
                rooms.remove(&room.name);
                rx.close();
                debug!(room = %room.name, "idle room removed");
                return true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
