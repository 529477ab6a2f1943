//! Live sessions of one endpoint, keyed by client id.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_core::ClientId;

use super::session::Session;

/// Registry of connected sessions.
///
/// Lookups and iteration take the read lock; only connection setup and
/// teardown take the write lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its client id, returning any displaced entry.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.client_id().clone();
        self.sessions.write().insert(id, session)
    }

    /// Remove a session by id.
    pub fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(client_id)
    }

    /// Point lookup by id.
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Whether a session is registered under `client_id`.
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().contains_key(client_id)
    }

    /// Copy of the current id → session map.
    pub fn snapshot(&self) -> HashMap<ClientId, Arc<Session>> {
        self.sessions.read().clone()
    }

    /// Visit every session under the read lock until `visit` breaks.
    ///
    /// `visit` must not call back into this registry's write paths.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Session>) -> ControlFlow<()>,
    {
        for session in self.sessions.read().values() {
            if visit(session).is_break() {
                break;
            }
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
