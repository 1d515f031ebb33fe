//! Registry of live Slurm clients, one per Controller.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use slurm_client::SlurmApi;

use crate::key::ObjectKey;

/// Shared handle to a Slurm client.
pub type SlurmClientRef = Arc<dyn SlurmApi>;

/// Maps a Controller key to its Slurm client.
///
/// Safe for concurrent use by every reconciler. Locks are held only for the
/// map operation itself, never across I/O.
#[derive(Default)]
pub struct ClientMap {
    clients: RwLock<HashMap<ObjectKey, SlurmClientRef>>,
}

impl ClientMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a client. Returns `false` and keeps the existing client if the
    /// key is already present.
    pub fn add(&self, key: ObjectKey, client: SlurmClientRef) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(&key) {
            return false;
        }
        clients.insert(key, client);
        true
    }

    /// Look up a client.
    pub fn get(&self, key: &ObjectKey) -> Option<SlurmClientRef> {
        self.clients.read().get(key).cloned()
    }

    /// Remove a client. Returns whether one was present.
    pub fn remove(&self, key: &ObjectKey) -> bool {
        self.clients.write().remove(key).is_some()
    }

    /// Whether a client is registered for the key.
    pub fn has(&self, key: &ObjectKey) -> bool {
        self.clients.read().contains_key(key)
    }

    /// Registered keys.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.clients.read().keys().cloned().collect()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl std::fmt::Debug for ClientMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMap")
            .field("keys", &self.keys())
            .finish()
    }
}
