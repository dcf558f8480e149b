//! JSON file store
//!
//! The whole routing state is one JSON document. Every mutation rewrites it
//! through a temporary file and a rename, so a crash leaves either the old
//! or the new state on disk, never a torn one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use swarmroute_core::{
    LastHash, Node, NodeId, RoutingStore, SeenHash, StoreError, StoreResult, StoreState,
};
use tracing::{debug, info};

use crate::paths::expand_path;

pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when it does not exist yet
    pub fn open(path: &Path) -> StoreResult<Self> {
        let path = expand_path(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let state = if path.exists() {
            let data = std::fs::read(&path)?;
            let state: StoreState = serde_json::from_slice(&data)
                .map_err(|e| StoreError::InvalidFormat(format!("{}: {}", path.display(), e)))?;
            info!(
                "Loaded routing state from {:?}: {} pooled nodes, {} swarms",
                path,
                state.node_pool.len(),
                state.swarms.len()
            );
            state
        } else {
            debug!("No routing state at {:?}, starting empty", path);
            StoreState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.lock().clone()
    }

    /// Apply `change` to a copy of the state and make the copy current only
    /// once it is on disk. A failed write leaves the old state in place.
    fn update<T>(&self, change: impl FnOnce(&mut StoreState) -> T) -> StoreResult<T> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = change(&mut next);
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    /// Like [`Self::update`], but skips the write when nothing was removed
    fn prune(&self, change: impl FnOnce(&mut StoreState) -> usize) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let pruned = change(&mut next);
        if pruned > 0 {
            self.persist(&next)?;
            *state = next;
        }
        Ok(pruned)
    }

    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RoutingStore for JsonFileStore {
    fn guard_nodes(&self) -> StoreResult<Vec<NodeId>> {
        Ok(self.state.lock().guard_nodes.clone())
    }

    fn replace_guard_nodes(&self, guards: &[NodeId]) -> StoreResult<()> {
        self.update(|s| s.guard_nodes = guards.to_vec())
    }

    fn node_pool(&self) -> StoreResult<Vec<Node>> {
        Ok(self.state.lock().node_pool.clone())
    }

    fn replace_node_pool(&self, nodes: &[Node]) -> StoreResult<()> {
        self.update(|s| s.node_pool = nodes.to_vec())
    }

    fn swarm(&self, identity: &str) -> StoreResult<Option<Vec<NodeId>>> {
        Ok(self.state.lock().swarms.get(identity).cloned())
    }

    fn replace_swarm(&self, identity: &str, members: &[NodeId]) -> StoreResult<()> {
        self.update(|s| {
            s.swarms.insert(identity.to_string(), members.to_vec());
        })
    }

    fn delete_swarm(&self, identity: &str) -> StoreResult<()> {
        self.update(|s| {
            s.swarms.remove(identity);
        })
    }

    fn last_hash(&self, node: &NodeId, identity: &str, now_ms: u64) -> StoreResult<Option<LastHash>> {
        Ok(self.state.lock().last_hash(node, identity, now_ms))
    }

    fn replace_last_hash(&self, node: &NodeId, identity: &str, entry: &LastHash) -> StoreResult<()> {
        self.update(|s| s.set_last_hash(node, identity, entry))
    }

    fn delete_last_hashes(&self, identity: &str) -> StoreResult<()> {
        self.update(|s| {
            s.last_hashes.remove(identity);
        })
    }

    fn prune_last_hashes(&self, now_ms: u64) -> StoreResult<usize> {
        self.prune(|s| s.prune_last_hashes(now_ms))
    }

    fn seen_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        Ok(self.state.lock().seen(hashes))
    }

    fn insert_seen_hashes(&self, entries: &[SeenHash]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.update(|s| s.insert_seen(entries))
    }

    fn prune_seen_hashes(&self, now_ms: u64) -> StoreResult<usize> {
        self.prune(|s| s.prune_seen(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> Node {
        Node {
            ip: format!("10.1.{}.1", n),
            port: 22021,
            pubkey_x25519: [n; 32],
            pubkey_ed25519: NodeId::from_bytes([n.wrapping_add(100); 32]),
            version: "2.8.0".into(),
        }
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("nested/state.json")).unwrap();
        assert_eq!(store.snapshot(), StoreState::default());
        assert!(store.guard_nodes().unwrap().is_empty());
        // nothing is written until the first change
        assert!(!store.path().exists());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.replace_node_pool(&[node(1), node(2), node(3)]).unwrap();
            store.replace_guard_nodes(&[*node(1).id()]).unwrap();
            store.replace_swarm("alice", &[*node(2).id(), *node(3).id()]).unwrap();
            store
                .replace_last_hash(node(2).id(), "alice", &LastHash { hash: "h9".into(), expires_at_ms: 77 })
                .unwrap();
            store
                .insert_seen_hashes(&[SeenHash { hash: "h9".into(), expires_at_ms: 1_000 }])
                .unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.node_pool().unwrap().len(), 3);
        assert_eq!(store.guard_nodes().unwrap(), vec![*node(1).id()]);
        assert_eq!(store.swarm("alice").unwrap().unwrap().len(), 2);
        assert_eq!(store.last_hash(node(2).id(), "alice", 0).unwrap().unwrap().hash, "h9");
        assert!(store.seen_hashes(&["h9".into()]).unwrap().contains("h9"));
    }

    #[test]
    fn test_deletes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.replace_swarm("bob", &[*node(4).id()]).unwrap();
        store
            .replace_last_hash(node(4).id(), "bob", &LastHash { hash: "x".into(), expires_at_ms: 1 })
            .unwrap();
        store.delete_swarm("bob").unwrap();
        store.delete_last_hashes("bob").unwrap();
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.swarm("bob").unwrap().is_none());
        assert!(store.last_hash(node(4).id(), "bob", 0).unwrap().is_none());
    }

    #[test]
    fn test_prune_rewrites_only_when_something_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();

        assert_eq!(store.prune_seen_hashes(10).unwrap(), 0);
        assert!(!path.exists());

        store
            .insert_seen_hashes(&[
                SeenHash { hash: "old".into(), expires_at_ms: 5 },
                SeenHash { hash: "new".into(), expires_at_ms: 500 },
            ])
            .unwrap();
        assert_eq!(store.prune_seen_hashes(10).unwrap(), 1);
        drop(store);

        let store = JsonFileStore::open(&path).unwrap();
        let seen = store.seen_hashes(&["old".into(), "new".into()]).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("new"));
    }

    #[test]
    fn test_expired_cursors_pruned_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).unwrap();
        store
            .replace_last_hash(node(1).id(), "alice", &LastHash { hash: "a".into(), expires_at_ms: 5 })
            .unwrap();
        store
            .replace_last_hash(node(2).id(), "alice", &LastHash { hash: "b".into(), expires_at_ms: 500 })
            .unwrap();

        assert!(store.last_hash(node(1).id(), "alice", 10).unwrap().is_none());
        assert_eq!(store.prune_last_hashes(10).unwrap(), 1);
        drop(store);

        let state = JsonFileStore::open(&path).unwrap().snapshot();
        assert_eq!(state.last_hashes["alice"].len(), 1);
        assert_eq!(state.last_hash(node(2).id(), "alice", 10).unwrap().hash, "b");
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("gone");
        let store = JsonFileStore::open(&sub.join("state.json")).unwrap();
        store.replace_node_pool(&[node(1), node(2)]).unwrap();
        store
            .insert_seen_hashes(&[SeenHash { hash: "old".into(), expires_at_ms: 5 }])
            .unwrap();

        std::fs::remove_dir_all(&sub).unwrap();

        assert!(store.replace_node_pool(&[node(3)]).is_err());
        assert!(store.replace_swarm("alice", &[*node(1).id()]).is_err());
        assert!(store.prune_seen_hashes(10).is_err());

        let state = store.snapshot();
        assert_eq!(state.node_pool, vec![node(1), node(2)]);
        assert!(state.swarms.is_empty());
        assert!(store.seen_hashes(&["old".into()]).unwrap().contains("old"));
    }

    #[test]
    fn test_no_temporary_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("state.json")).unwrap();
        store.replace_guard_nodes(&[*node(9).id()]).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = JsonFileStore::open(&path);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }
}
