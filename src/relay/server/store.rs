//! The server-wide peer registry, keyed on the hashed peer ID, behind a
//! single `parking_lot::Mutex` since every operation here is synchronous
//! and brief (never held across an `.await`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::relay::codec::HashedId;
use crate::relay::server::peer::Peer;

/// Keyed registry on the hex `HashedStringId`.
pub struct Store {
    peers: parking_lot::Mutex<HashMap<String, Arc<Peer>>>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            peers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `peer`, replacing and returning any prior entry for the
    /// same ID so the caller can await its teardown (e.g. send it a Close
    /// frame) without holding the store lock.
    pub fn add_or_replace(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        let key = peer.id_string().to_owned();
        self.peers.lock().insert(key, peer)
    }

    pub fn get(&self, id: &HashedId) -> Option<Arc<Peer>> {
        self.peers.lock().get(&id.to_string()).cloned()
    }

    /// Removes the entry for `id` only if the stored handle is the same
    /// `Arc` as `expected`, using pointer identity rather than ID
    /// equality. This prevents a stale teardown task from evicting a
    /// newer session that reconnected under the same peer ID (an ABA
    /// hazard: key reused, handle different).
    pub fn remove(&self, id: &HashedId, expected: &Arc<Peer>) -> bool {
        let mut guard = self.peers.lock();
        let key = id.to_string();
        match guard.get(&key) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                guard.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all currently registered peers, used by the server to
    /// broadcast a graceful close on shutdown.
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
