use crate::connection::{Connection, ConnectionId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Live authenticated connections keyed by user id.
///
/// A second registration for the same user on a different connection replaces the
/// previous mapping; the replaced connection is returned so the caller can apply its
/// session policy. A reverse index keeps `unregister` proportional to the number of
/// users a connection authenticated as.
pub struct ConnectionRegistry {
    by_user: DashMap<String, Arc<Connection>>,
    by_connection: DashMap<ConnectionId, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_user: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Map `user_id` to `connection`, returning the connection it replaced, if any.
    pub fn register(&self, user_id: &str, connection: &Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = self
            .by_user
            .insert(user_id.to_string(), Arc::clone(connection))
            .filter(|prev| prev.id() != connection.id());

        if let Some(prev) = &previous {
            if let Some(mut users) = self.by_connection.get_mut(&prev.id()) {
                users.remove(user_id);
            }
            info!(
                "User '{}' moved from connection {} to {}",
                user_id,
                prev.id(),
                connection.id()
            );
        }

        self.by_connection
            .entry(connection.id())
            .or_default()
            .insert(user_id.to_string());

        debug!("User '{}' registered on connection {}", user_id, connection.id());
        previous
    }

    /// Remove every mapping that points at `connection`. Connections that never
    /// authenticated are a no-op.
    pub fn unregister(&self, connection: &Connection) {
        let Some((_, users)) = self.by_connection.remove(&connection.id()) else {
            return;
        };

        for user_id in users {
            // Only drop the mapping if a newer connection has not taken it over.
            if self
                .by_user
                .remove_if(&user_id, |_, current| current.id() == connection.id())
                .is_some()
            {
                debug!("User '{}' unregistered from connection {}", user_id, connection.id());
            }
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.by_user.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
