//! Room directory and in-process connections.
//!
//! The broker maps room names to running room actors, spawning a room the
//! first time anyone connects to it. Rooms other than the default one stop
//! and leave the directory when their last connection closes; the default
//! room lives as long as the broker. Transports never touch room state
//! directly: they obtain a [`BrokerConnection`] and pump events through it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ChatConfig;
use crate::protocol::{ClientEvent, ConnectionId, ServerEvent};
use crate::room::{Room, RoomDirectory, RoomHandle};

pub struct ChatBroker {
    config: Arc<ChatConfig>,
    rooms: RoomDirectory,
}

impl ChatBroker {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomHandle>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handle to `name`, spawning the room actor if it is not running.
    /// A blank name selects the default room.
    pub fn room(&self, name: &str) -> RoomHandle {
        let mut rooms = self.rooms();
        self.room_in(&mut rooms, name)
    }

    fn room_in(&self, rooms: &mut HashMap<String, RoomHandle>, name: &str) -> RoomHandle {
        let name = match name.trim() {
            "" => self.config.default_room.as_str(),
            n => n,
        };
        if let Some(handle) = rooms.get(name).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let room = Room::new(name, &self.config);
        let handle = if name == self.config.default_room {
            RoomHandle::spawn(room)
        } else {
            RoomHandle::spawn_reaped(room, Arc::clone(&self.rooms))
        };
        info!(room = %name, "room created");
        rooms.insert(name.to_string(), handle.clone());
        handle
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a connection to the default room.
    pub fn connect(&self) -> BrokerConnection {
        self.connect_to(&self.config.default_room)
    }

    /// Open a connection to `room`. The connection is attached (receives
    /// nothing yet) until it sends `join_chat`.
    pub fn connect_to(&self, room: &str) -> BrokerConnection {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = mpsc::unbounded_channel();
        let room = {
            // Attach under the directory lock so an idle room cannot retire
            // between lookup and attach.
            let mut rooms = self.rooms();
            let room = self.room_in(&mut rooms, room);
            room.attach(&id, tx);
            room
        };
        debug!(room = %room.name(), conn = %id, "connection opened");
        BrokerConnection {
            sender: ConnectionSender { id, room },
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Inbound half of a connection. Dropping it detaches the connection, which
/// removes its session from the room.
#[derive(Debug)]
pub struct ConnectionSender {
    id: ConnectionId,
    room: RoomHandle,
}

impl ConnectionSender {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room_name(&self) -> &str {
        self.room.name()
    }

    /// Queue an event for the room. Returns `false` if the room has stopped.
    pub fn send(&self, event: ClientEvent) -> bool {
        self.room.dispatch(&self.id, event)
    }
}

impl Drop for ConnectionSender {
    fn drop(&mut self) {
        debug!(room = %self.room.name(), conn = %self.id, "connection closed");
        self.room.detach(&self.id);
    }
}

/// A live connection to one room.
#[derive(Debug)]
pub struct BrokerConnection {
    sender: ConnectionSender,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

impl BrokerConnection {
    pub fn id(&self) -> &str {
        self.sender.id()
    }

    pub fn room_name(&self) -> &str {
        self.sender.room_name()
    }

    pub fn send(&self, event: ClientEvent) -> bool {
        self.sender.send(event)
    }

    /// Next event for this connection, in room order.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Split into independently owned halves, for transports that read and
    /// write concurrently.
    pub fn into_split(self) -> (ConnectionSender, mpsc::UnboundedReceiver<ServerEvent>) {
        (self.sender, self.events)
    }
}
