//! Session registry: one entry per joined connection.
//!
//! Entries are created on join and removed on leave; nothing is retained
//! after a disconnect. Display names may collide at join time, uniqueness is
//! only enforced when a session renames itself (see `Room::change_username`).

use std::collections::HashMap;

use crate::protocol::{now_ms, ConnectionId, UserInfo};

const ADJECTIVES: &[&str] = &[
    "Brave", "Swift", "Clever", "Mighty", "Sneaky", "Jolly", "Lucky", "Noble", "Fierce", "Quiet",
    "Rusty", "Golden",
];

const NOUNS: &[&str] = &[
    "Knight", "Goblin", "Wizard", "Dragon", "Ranger", "Bard", "Paladin", "Rogue", "Druid", "Griffin",
    "Golem", "Squire",
];

/// Random display name of the form `AdjectiveNoun<0-999>`.
pub fn generate_username() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let number: u16 = rng.gen_range(0..1000);
    format!("{adjective}{noun}{number}")
}

/// Presence and identity state of one joined connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: ConnectionId,
    pub username: String,
    /// Fixed at join.
    pub is_admin: bool,
    pub joined_at: u64,
    pub last_active: u64,
    pub is_typing: bool,
}

impl Session {
    pub fn new(id: impl Into<ConnectionId>, username: impl Into<String>, is_admin: bool) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            username: username.into(),
            is_admin,
            joined_at: now,
            last_active: now,
            is_typing: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = now_ms();
    }

    pub fn info(&self) -> UserInfo {
        UserInfo {
            user_id: self.id.clone(),
            username: self.username.clone(),
            is_admin: self.is_admin,
            joined_at: self.joined_at,
            is_typing: self.is_typing,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
    /// Ids in join order.
    order: Vec<ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous entry with the same id.
    pub fn insert(&mut self, session: Session) {
        let id = session.id.clone();
        if self.sessions.insert(id.clone(), session).is_some() {
            self.order.retain(|o| *o != id);
        }
        self.order.push(id);
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.order.retain(|o| o != id);
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a live session other than `except` holds exactly `name`.
    pub fn name_taken(&self, name: &str, except: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.id != except && s.username == name)
    }

    /// Sessions in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.iter().map(|s| s.id.clone()).collect()
    }

    pub fn admin_ids(&self) -> Vec<ConnectionId> {
        self.iter().filter(|s| s.is_admin).map(|s| s.id.clone()).collect()
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.iter().map(Session::info).collect()
    }

    /// Names of sessions with the typing flag set, in join order, optionally
    /// leaving out one session.
    pub fn typing_names(&self, except: Option<&str>) -> Vec<String> {
        self.iter()
            .filter(|s| s.is_typing && Some(s.id.as_str()) != except)
            .map(|s| s.username.clone())
            .collect()
    }

    /// `(id, name)` of every typing session, in join order.
    pub fn typists(&self) -> Vec<(&str, &str)> {
        self.iter()
            .filter(|s| s.is_typing)
            .map(|s| (s.id.as_str(), s.username.as_str()))
            .collect()
    }
}
