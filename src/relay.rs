//! WebSocket relay for room-scoped signaling between peers

mod connections;
mod dispatcher;
mod rooms;
mod server;
mod session;
mod types;

use std::sync::Arc;

pub use connections::ConnectionRegistry;
pub use dispatcher::{DeliveryReport, Dispatcher};
pub use rooms::RoomRegistry;
pub use server::RelayServer;
pub use session::{Keepalive, Session, SessionState};
pub use types::{
    ConnectionId, MessageKind, PeerSender, RelayError, RelayMessage, RoomId, WriteFailure,
};

/// Shared handle to the registries, cloned into every session
#[derive(Debug, Clone)]
pub struct Relay {
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
}

/// Point-in-time counters for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub connections: usize,
    pub rooms: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        Self {
            connections: Arc::new(ConnectionRegistry::new()),
            dispatcher: Dispatcher::new(rooms.clone()),
            rooms,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.connections.len(),
            rooms: self.rooms.room_count(),
        }
    }
}
