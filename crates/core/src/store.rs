//! Persistence collaborator
//!
//! The routing layer only ever performs narrow get/replace/delete calls
//! through [`RoutingStore`]. [`StoreState`] is the plain data behind both the
//! in-memory store here and the JSON file store.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{LastHash, Node, NodeId, SeenHash};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operations the routing layer needs
pub trait RoutingStore: Send + Sync {
    fn guard_nodes(&self) -> StoreResult<Vec<NodeId>>;
    fn replace_guard_nodes(&self, guards: &[NodeId]) -> StoreResult<()>;

    fn node_pool(&self) -> StoreResult<Vec<Node>>;
    fn replace_node_pool(&self, nodes: &[Node]) -> StoreResult<()>;

    fn swarm(&self, identity: &str) -> StoreResult<Option<Vec<NodeId>>>;
    fn replace_swarm(&self, identity: &str, members: &[NodeId]) -> StoreResult<()>;
    fn delete_swarm(&self, identity: &str) -> StoreResult<()>;

    /// Cursor for `(node, identity)`; an entry expired at `now_ms` reads as absent
    fn last_hash(&self, node: &NodeId, identity: &str, now_ms: u64) -> StoreResult<Option<LastHash>>;
    fn replace_last_hash(&self, node: &NodeId, identity: &str, entry: &LastHash) -> StoreResult<()>;
    fn delete_last_hashes(&self, identity: &str) -> StoreResult<()>;
    /// Remove cursors that expired before `now_ms`, returning how many went
    fn prune_last_hashes(&self, now_ms: u64) -> StoreResult<usize>;

    /// The subset of `hashes` already recorded as seen
    fn seen_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>>;
    fn insert_seen_hashes(&self, entries: &[SeenHash]) -> StoreResult<()>;
    /// Remove entries that expired before `now_ms`, returning how many went
    fn prune_seen_hashes(&self, now_ms: u64) -> StoreResult<usize>;
}

/// Everything the routing layer persists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub guard_nodes: Vec<NodeId>,
    pub node_pool: Vec<Node>,
    pub swarms: BTreeMap<String, Vec<NodeId>>,
    /// identity -> node -> cursor
    pub last_hashes: BTreeMap<String, BTreeMap<String, LastHash>>,
    /// hash -> expiry (unix ms)
    pub seen_hashes: BTreeMap<String, u64>,
}

impl StoreState {
    pub fn last_hash(&self, node: &NodeId, identity: &str, now_ms: u64) -> Option<LastHash> {
        self.last_hashes
            .get(identity)
            .and_then(|per_node| per_node.get(&node.to_string()))
            .filter(|entry| entry.expires_at_ms > now_ms)
            .cloned()
    }

    pub fn set_last_hash(&mut self, node: &NodeId, identity: &str, entry: &LastHash) {
        self.last_hashes
            .entry(identity.to_string())
            .or_default()
            .insert(node.to_string(), entry.clone());
    }

    pub fn prune_last_hashes(&mut self, now_ms: u64) -> usize {
        let mut pruned = 0;
        for per_node in self.last_hashes.values_mut() {
            let before = per_node.len();
            per_node.retain(|_, entry| entry.expires_at_ms > now_ms);
            pruned += before - per_node.len();
        }
        self.last_hashes.retain(|_, per_node| !per_node.is_empty());
        pruned
    }

    pub fn seen(&self, hashes: &[String]) -> HashSet<String> {
        hashes
            .iter()
            .filter(|h| self.seen_hashes.contains_key(h.as_str()))
            .cloned()
            .collect()
    }

    pub fn insert_seen(&mut self, entries: &[SeenHash]) {
        for entry in entries {
            self.seen_hashes.insert(entry.hash.clone(), entry.expires_at_ms);
        }
    }

    pub fn prune_seen(&mut self, now_ms: u64) -> usize {
        let before = self.seen_hashes.len();
        self.seen_hashes.retain(|_, expires| *expires > now_ms);
        before - self.seen_hashes.len()
    }
}

/// Volatile store, used by tests and short-lived tools
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> StoreState {
        self.state.lock().clone()
    }
}

impl RoutingStore for MemoryStore {
    fn guard_nodes(&self) -> StoreResult<Vec<NodeId>> {
        Ok(self.state.lock().guard_nodes.clone())
    }

    fn replace_guard_nodes(&self, guards: &[NodeId]) -> StoreResult<()> {
        self.state.lock().guard_nodes = guards.to_vec();
        Ok(())
    }

    fn node_pool(&self) -> StoreResult<Vec<Node>> {
        Ok(self.state.lock().node_pool.clone())
    }

    fn replace_node_pool(&self, nodes: &[Node]) -> StoreResult<()> {
        self.state.lock().node_pool = nodes.to_vec();
        Ok(())
    }

    fn swarm(&self, identity: &str) -> StoreResult<Option<Vec<NodeId>>> {
        Ok(self.state.lock().swarms.get(identity).cloned())
    }

    fn replace_swarm(&self, identity: &str, members: &[NodeId]) -> StoreResult<()> {
        self.state
            .lock()
            .swarms
            .insert(identity.to_string(), members.to_vec());
        Ok(())
    }

    fn delete_swarm(&self, identity: &str) -> StoreResult<()> {
        self.state.lock().swarms.remove(identity);
        Ok(())
    }

    fn last_hash(&self, node: &NodeId, identity: &str, now_ms: u64) -> StoreResult<Option<LastHash>> {
        Ok(self.state.lock().last_hash(node, identity, now_ms))
    }

    fn replace_last_hash(&self, node: &NodeId, identity: &str, entry: &LastHash) -> StoreResult<()> {
        self.state.lock().set_last_hash(node, identity, entry);
        Ok(())
    }

    fn delete_last_hashes(&self, identity: &str) -> StoreResult<()> {
        self.state.lock().last_hashes.remove(identity);
        Ok(())
    }

    fn prune_last_hashes(&self, now_ms: u64) -> StoreResult<usize> {
        Ok(self.state.lock().prune_last_hashes(now_ms))
    }

    fn seen_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        Ok(self.state.lock().seen(hashes))
    }

    fn insert_seen_hashes(&self, entries: &[SeenHash]) -> StoreResult<()> {
        self.state.lock().insert_seen(entries);
        Ok(())
    }

    fn prune_seen_hashes(&self, now_ms: u64) -> StoreResult<usize> {
        Ok(self.state.lock().prune_seen(now_ms))
    }
}
