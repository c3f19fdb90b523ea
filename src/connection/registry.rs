//! Connection Registry
//!
//! The only shared mutable state of the relay: the set of connections that
//! completed the handshake and have not yet closed. All access goes through
//! one mutex that is held for map operations only, never across I/O.
//! Delivery iterates a `Snapshot` taken under the lock and released before
//! the first send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::types::{ConnectionId, TransportHandle};
use crate::error::RelayError;

/// One registered connection
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub id: ConnectionId,
    pub display_name: Arc<str>,
    pub handle: TransportHandle,
}

/// Immutable point-in-time copy of the registry, ordered by identity
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<RegistryEntry>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Entries other than `origin`
    pub fn recipients(&self, origin: ConnectionId) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(move |entry| entry.id != origin)
    }
}

/// Registry of live, named connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The map has no multi-step invariants, so a panic while holding the
    // lock cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry, failing with `DuplicateIdentity` if `id` is present
    pub fn register(
        &self,
        id: ConnectionId,
        display_name: &str,
        handle: TransportHandle,
    ) -> Result<(), RelayError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(RelayError::DuplicateIdentity(id));
        }
        entries.insert(
            id,
            RegistryEntry {
                id,
                display_name: Arc::from(display_name),
                handle,
            },
        );
        debug!(connection_id = %id, name = display_name, registered = entries.len(), "Connection registered");
        Ok(())
    }

    /// Register and return a guard that unregisters on drop
    pub fn register_guarded(
        self: &Arc<Self>,
        id: ConnectionId,
        display_name: &str,
        handle: TransportHandle,
    ) -> Result<Registration, RelayError> {
        self.register(id, display_name, handle)?;
        Ok(Registration {
            registry: Arc::clone(self),
            id,
            released: false,
        })
    }

    /// Remove an entry; absent identities are not an error
    pub fn unregister(&self, id: ConnectionId) -> Option<RegistryEntry> {
        let mut entries = self.lock();
        let removed = entries.remove(&id);
        if removed.is_some() {
            debug!(connection_id = %id, registered = entries.len(), "Connection unregistered");
        }
        removed
    }

    /// Copy of all current entries, safe to iterate without the lock
    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Vec<RegistryEntry> = self.lock().values().cloned().collect();
        entries.sort_by_key(|entry| entry.id);
        Snapshot { entries }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Sorted display names of all registered connections
    pub fn display_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .values()
            .map(|entry| entry.display_name.to_string())
            .collect();
        names.sort();
        names
    }
}

/// Scoped registration: the entry is removed when the guard goes away,
/// whichever way the owning session exits.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    released: bool,
}

impl Registration {
    /// Unregister now. Returns whether this call removed the entry.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.registry.unregister(self.id).is_some()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released && self.release() {
            warn!(connection_id = %self.id, "Registration dropped without explicit release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message_writer;

    fn handle(id: u64) -> TransportHandle {
        let (local, _remote) = tokio::io::duplex(64);
        TransportHandle::new(ConnectionId::new(id), message_writer(local, 64))
    }

    #[tokio::test]
    async fn test_register_and_snapshot() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId::new(2), "Bob", handle(2)).unwrap();
        registry.register(ConnectionId::new(1), "Alice", handle(1)).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        let ids: Vec<u64> = snapshot.iter().map(|e| e.id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(registry.display_names(), vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::new(1);
        registry.register(id, "Alice", handle(1)).unwrap();

        let err = registry.register(id, "Imposter", handle(1)).unwrap_err();
        assert!(matches!(err, RelayError::DuplicateIdentity(dup) if dup == id));
        assert_eq!(registry.display_names(), vec!["Alice"]);
    }

    #[tokio::test]
    async fn test_unregister_absent_is_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(ConnectionId::new(9)).is_none());

        registry.register(ConnectionId::new(9), "Ghost", handle(9)).unwrap();
        assert!(registry.unregister(ConnectionId::new(9)).is_some());
        assert!(registry.unregister(ConnectionId::new(9)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_point_in_time() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId::new(1), "Alice", handle(1)).unwrap();

        let before = registry.snapshot();
        registry.unregister(ConnectionId::new(1));
        registry.register(ConnectionId::new(2), "Bob", handle(2)).unwrap();

        assert!(before.contains(ConnectionId::new(1)));
        assert!(!before.contains(ConnectionId::new(2)));
        assert_eq!(before.recipients(ConnectionId::new(1)).count(), 0);
    }

    #[tokio::test]
    async fn test_registration_guard_releases_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = ConnectionId::new(5);

        {
            let _registration = registry.register_guarded(id, "Eve", handle(5)).unwrap();
            assert!(registry.contains(id));
        }
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_registration_release_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = ConnectionId::new(6);

        let mut registration = registry.register_guarded(id, "Dan", handle(6)).unwrap();
        assert!(registration.release());
        assert!(!registration.release());

        // A later registration of the same identity must survive the old guard
        registry.register(id, "Dan", handle(6)).unwrap();
        drop(registration);
        assert!(registry.contains(id));
    }
}
