use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use super::types::{ConnectionId, PeerSender, RoomId};

#[derive(Debug, Default)]
struct Room {
    members: HashMap<ConnectionId, PeerSender>,
}

/// Room token to member map. Rooms are created on first join and dropped
/// when their last member leaves.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`, creating the room if needed. Joining again
    /// replaces the stored sender.
    pub fn join(&self, room: &RoomId, conn: ConnectionId, sender: PeerSender) {
        let mut rooms = self.lock();
        let entry = rooms.entry(room.clone()).or_insert_with(|| {
            info!("Room created: {}", room);
            Room::default()
        });
        entry.members.insert(conn, sender);
        info!(
            "Connection {} joined room {} ({} members)",
            conn,
            room,
            entry.members.len()
        );
    }

    /// Returns `false` if `conn` was not a member of `room`.
    pub fn leave(&self, room: &RoomId, conn: ConnectionId) -> bool {
        let mut rooms = self.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };

        let removed = entry.members.remove(&conn).is_some();
        if removed {
            info!("Connection {} left room {}", conn, room);
        }

        if entry.members.is_empty() {
            rooms.remove(room);
            debug!("Room {} removed (empty)", room);
        }
        removed
    }

    /// Snapshot of the current members. Unknown rooms are empty.
    pub fn members_of(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.lock()
            .get(room)
            .map(|entry| entry.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.lock().contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    /// Visit every member of `room` while holding the registry lock, so
    /// membership cannot change mid fan-out. `f` must not block.
    pub(crate) fn for_each_member<F>(&self, room: &RoomId, mut f: F)
    where
        F: FnMut(ConnectionId, &PeerSender),
    {
        let rooms = self.lock();
        if let Some(entry) = rooms.get(room) {
            for (conn, sender) in &entry.members {
                f(*conn, sender);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RoomId, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
