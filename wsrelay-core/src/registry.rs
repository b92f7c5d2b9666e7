//! Registry of live clients.
//!
//! The registry maps each [`ClientId`] to a weak handle on its [`Client`].
//! The client's own tasks keep it alive; once they have all returned the
//! weak handle stops upgrading, and the teardown path removes the entry.
//!
//! Membership in the registry is what "connected" means: broadcasts walk a
//! snapshot of it, and eviction is simply removal.
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::registry::ClientRegistry;
//!
//! let registry = ClientRegistry::new();
//! assert_eq!(registry.len(), 0);
//! assert!(registry.snapshot().is_empty());
//! ```

use crate::client::{Client, ClientId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Concurrent map of connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Weak<Client>>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Registers a client and returns the new number of entries.
    pub fn insert(&self, client: &Arc<Client>) -> usize {
        self.clients
            .insert(client.id().clone(), Arc::downgrade(client));
        let count = self.clients.len();
        tracing::debug!(client = %client.id(), total = count, "client registered");
        count
    }

    /// Removes a client. Returns `false` if it was not registered.
    pub fn remove(&self, id: &str) -> bool {
        self.clients.remove(id).is_some()
    }

    /// Returns `true` if the id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Looks up a live client.
    pub fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).and_then(|entry| entry.value().upgrade())
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Strong handles to every registered client that is still alive.
    ///
    /// The snapshot is taken up front so callers may evict while walking it.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// One client per fingerprint.
    ///
    /// Clients without a fingerprint all count as the same visitor.
    pub fn unique(&self) -> Vec<Arc<Client>> {
        let mut seen = HashSet::new();
        self.snapshot()
            .into_iter()
            .filter(|client| seen.insert(client.fingerprint()))
            .collect()
    }

    /// Number of distinct fingerprints among registered clients.
    pub fn unique_count(&self) -> usize {
        self.unique().len()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .finish()
    }
}
