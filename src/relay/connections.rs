use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::types::ConnectionId;

/// Set of live connections, independent of room membership
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    live: Mutex<HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the connection was already registered.
    pub fn register(&self, conn: ConnectionId) -> bool {
        self.lock().insert(conn)
    }

    /// Returns `false` if the connection was not registered.
    pub fn deregister(&self, conn: ConnectionId) -> bool {
        self.lock().remove(&conn)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.lock().contains(&conn)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // every critical section leaves the set consistent, so a panic elsewhere
    // never invalidates it
    fn lock(&self) -> MutexGuard<'_, HashSet<ConnectionId>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
