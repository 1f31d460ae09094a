use std::collections::HashMap;

use dashmap::DashMap;
use log::debug;

use crate::types::peer::{Peer, DISTANCE_DIRECT};
use crate::types::peer_id::PeerId;

/// The set of currently known peers, keyed by identity
///
/// Mutated only by the worker; snapshot reads are safe from any thread. The
/// local peer is never an entry.
pub struct PeerTable {
    peers: DashMap<PeerId, Peer>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Insert a peer; `false` if the id is already present
    pub fn insert(&self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id) {
            return false;
        }
        debug!("Registered peer {} at {}", peer.id, peer.endpoint());
        self.peers.insert(peer.id, peer);
        true
    }

    /// Replace or insert a peer record
    pub fn put(&self, peer: Peer) {
        self.peers.insert(peer.id, peer);
    }

    /// Remove a peer, returning the old record
    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        let removed = self.peers.remove(id).map(|(_, peer)| peer);
        if removed.is_some() {
            debug!("Unregistered peer {}", id);
        }
        removed
    }

    /// Look up a peer by id (cloned record)
    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.get(id).map(|entry| entry.clone())
    }

    /// Whether the table holds an entry for `id`
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Apply a mutation to a peer record; `false` if absent
    pub fn update<F: FnOnce(&mut Peer)>(&self, id: &PeerId, f: F) -> bool {
        if let Some(mut entry) = self.peers.get_mut(id) {
            f(&mut entry);
            true
        } else {
            false
        }
    }

    /// Read-only snapshot of the whole table
    pub fn snapshot(&self) -> HashMap<PeerId, Peer> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), entry.clone()))
            .collect()
    }

    /// All peers reached over an owned socket
    pub fn direct_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.distance == DISTANCE_DIRECT)
            .map(|entry| entry.clone())
            .collect()
    }

    /// All peers that name `bridge` as their relay
    pub fn bridged_through(&self, bridge: &PeerId) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.bridge.as_ref() == Some(bridge))
            .map(|entry| entry.clone())
            .collect()
    }

    /// All ids in lexicographic order
    pub fn ids_sorted(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every record
    pub fn clear(&self) {
        self.peers.clear();
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}
