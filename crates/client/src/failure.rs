//! Failure attribution
//!
//! Counts failures per node and per path and turns repeated failures into
//! evictions: nodes leave the pool, their swarms and their paths; paths
//! that keep failing are dropped together with their guard.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use swarmroute_core::{Node, NodeId, Result, RoutingConfig};
use tracing::{debug, info, warn};

use crate::path::{PathBuilder, RepairOutcome};
use crate::pool::NodePool;
use crate::swarm::SwarmDirectory;

pub struct FailureTracker {
    config: Arc<RoutingConfig>,
    pool: NodePool,
    swarms: Arc<SwarmDirectory>,
    paths: PathBuilder,
    node_failures: Mutex<HashMap<NodeId, u32>>,
    /// guard -> (path generation, count)
    path_failures: Mutex<HashMap<NodeId, (u64, u32)>>,
}

impl FailureTracker {
    pub fn new(
        config: Arc<RoutingConfig>,
        pool: NodePool,
        swarms: Arc<SwarmDirectory>,
        paths: PathBuilder,
    ) -> Self {
        Self {
            config,
            pool,
            swarms,
            paths,
            node_failures: Mutex::new(HashMap::new()),
            path_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_failure_count(&self, id: &NodeId) -> u32 {
        self.node_failures.lock().get(id).copied().unwrap_or(0)
    }

    /// Failures counted against the current path through `guard`
    pub fn path_failure_count(&self, guard: &NodeId) -> u32 {
        let generation = self.paths.generation();
        match self.path_failures.lock().get(guard) {
            Some((g, count)) if *g == generation => *count,
            _ => 0,
        }
    }

    /// Count one failure against `id`. Returns true when the node was
    /// evicted as a result.
    pub fn on_node_failure(&self, id: &NodeId, swarm: Option<&str>) -> Result<bool> {
        let count = {
            let mut failures = self.node_failures.lock();
            let count = failures.entry(*id).or_insert(0);
            *count += 1;
            *count
        };
        debug!("Node {} failure {}/{}", id.short(), count, self.config.node_failure_threshold);

        if count < self.config.node_failure_threshold {
            return Ok(false);
        }
        self.evict_node(id, swarm)?;
        Ok(true)
    }

    /// Remove `id` from the pool, from `swarm` and from every path that
    /// uses it, repairing those paths where possible.
    pub fn evict_node(&self, id: &NodeId, swarm: Option<&str>) -> Result<()> {
        info!("Evicting node {}", id.short());
        self.node_failures.lock().remove(id);
        self.pool.drop_node(id)?;
        if let Some(identity) = swarm {
            self.swarms.drop_member(identity, id)?;
        }

        for path in self.paths.paths_containing(id) {
            let guard = *path.guard().id();
            match self.paths.repair(&guard, id) {
                Ok(RepairOutcome::Repaired(_)) | Ok(RepairOutcome::NotFound) => {}
                Ok(RepairOutcome::GuardFailed) => self.drop_path(&guard)?,
                Err(e) => {
                    warn!("Could not repair path via {}: {}", guard.short(), e);
                    self.drop_path(&guard)?;
                }
            }
        }
        Ok(())
    }

    /// Count one failure against the path through `guard`. At the
    /// threshold every relay on the path takes a node failure and the path
    /// is dropped. Returns true when the path was dropped.
    pub fn on_path_failure(&self, guard: &NodeId) -> Result<bool> {
        let Some(path) = self.paths.path_for_guard(guard) else {
            // path already replaced, blame the guard alone
            self.on_node_failure(guard, None)?;
            return Ok(false);
        };

        let generation = self.paths.generation();
        let count = {
            let mut failures = self.path_failures.lock();
            let entry = failures.entry(*guard).or_insert((generation, 0));
            if entry.0 != generation {
                *entry = (generation, 0);
            }
            entry.1 += 1;
            entry.1
        };
        debug!("Path via {} failure {}/{}", guard.short(), count, self.config.path_failure_threshold);

        if count < self.config.path_failure_threshold {
            return Ok(false);
        }

        warn!("Path via {} reached failure threshold", guard.short());
        for relay in path.relays() {
            self.on_node_failure(relay.id(), None)?;
        }
        self.drop_path(guard)?;
        Ok(true)
    }

    /// The network says `responder` no longer serves `identity`
    pub fn on_redirect(
        &self,
        identity: &str,
        replacement: Option<&[Node]>,
        responder: &NodeId,
    ) -> Result<()> {
        match replacement {
            Some(members) if !members.is_empty() => self.swarms.update_swarm(identity, members),
            _ => self.swarms.drop_member(identity, responder).map(|_| ()),
        }
    }

    pub fn on_path_success(&self, guard: &NodeId) {
        self.path_failures.lock().remove(guard);
    }

    pub fn on_node_success(&self, id: &NodeId) {
        self.node_failures.lock().remove(id);
    }

    fn drop_path(&self, guard: &NodeId) -> Result<()> {
        self.path_failures.lock().remove(guard);
        self.paths.drop_path(guard).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardSelector;
    use crate::test_support::{make_node, make_nodes, store_with_pool, test_config, MockTransport};
    use swarmroute_core::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        pool: NodePool,
        swarms: Arc<SwarmDirectory>,
        paths: PathBuilder,
        tracker: FailureTracker,
    }

    async fn fixture(pool_size: u16) -> Fixture {
        let config = Arc::new(test_config());
        let store = store_with_pool(&make_nodes(0..pool_size));
        let transport = Arc::new(MockTransport::new());
        let pool = NodePool::new(config.clone(), transport.clone(), store.clone()).unwrap();
        let guards = Arc::new(GuardSelector::new(config.clone(), transport, pool.clone(), store.clone()));
        let paths = PathBuilder::new(config.clone(), pool.clone(), guards);
        paths.build().await.unwrap();
        let swarms = Arc::new(SwarmDirectory::new(config.clone(), pool.clone(), store.clone()));
        let tracker = FailureTracker::new(config, pool.clone(), swarms.clone(), paths.clone());
        Fixture {
            store,
            pool,
            swarms,
            paths,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_node_evicted_at_threshold() {
        let f = fixture(20).await;
        let path = f.paths.paths()[0].clone();
        let relay = *path.relays()[1].id();
        f.swarms.update_swarm("alice", &[path.relays()[1].clone(), make_node(18), make_node(19)]).unwrap();

        assert!(!f.tracker.on_node_failure(&relay, Some("alice")).unwrap());
        assert!(!f.tracker.on_node_failure(&relay, Some("alice")).unwrap());
        assert_eq!(f.tracker.node_failure_count(&relay), 2);
        assert!(f.tracker.on_node_failure(&relay, Some("alice")).unwrap());

        assert_eq!(f.tracker.node_failure_count(&relay), 0);
        assert!(!f.pool.contains(&relay));
        assert!(!f.swarms.members("alice").unwrap().contains(&relay));
        assert!(f.paths.paths_containing(&relay).is_empty());
        // the path survived through repair
        let repaired = f.paths.path_for_guard(path.guard().id()).unwrap();
        assert_eq!(repaired.len(), 3);
        assert!(repaired.is_distinct());
        assert!(!f.store.snapshot().node_pool.iter().any(|n| *n.id() == relay));
    }

    #[tokio::test]
    async fn test_evicting_guard_drops_its_path() {
        let f = fixture(15).await;
        let guard = *f.paths.paths()[0].guard().id();

        f.tracker.evict_node(&guard, None).unwrap();
        assert!(f.paths.path_for_guard(&guard).is_none());
        assert_eq!(f.paths.paths().len(), 2);
        assert!(!f.store.snapshot().guard_nodes.contains(&guard));
    }

    #[tokio::test]
    async fn test_path_threshold_cascades_to_relays() {
        let f = fixture(15).await;
        let path = f.paths.paths()[0].clone();
        let guard = *path.guard().id();

        assert!(!f.tracker.on_path_failure(&guard).unwrap());
        assert!(!f.tracker.on_path_failure(&guard).unwrap());
        assert_eq!(f.tracker.path_failure_count(&guard), 2);
        assert!(f.tracker.on_path_failure(&guard).unwrap());

        assert!(f.paths.path_for_guard(&guard).is_none());
        assert!(!f.pool.contains(&guard));
        assert_eq!(f.tracker.path_failure_count(&guard), 0);
        for relay in path.relays() {
            assert_eq!(f.tracker.node_failure_count(relay.id()), 1);
        }
    }

    #[tokio::test]
    async fn test_path_counter_resets_on_rebuild() {
        let f = fixture(15).await;
        let guard = *f.paths.paths()[0].guard().id();

        f.tracker.on_path_failure(&guard).unwrap();
        f.tracker.on_path_failure(&guard).unwrap();
        f.paths.build().await.unwrap();
        assert_eq!(f.tracker.path_failure_count(&guard), 0);
    }

    #[tokio::test]
    async fn test_success_resets_counters() {
        let f = fixture(15).await;
        let path = f.paths.paths()[0].clone();
        let guard = *path.guard().id();
        let relay = *path.relays()[0].id();

        f.tracker.on_path_failure(&guard).unwrap();
        f.tracker.on_node_failure(&relay, None).unwrap();
        f.tracker.on_path_success(&guard);
        f.tracker.on_node_success(&relay);
        assert_eq!(f.tracker.path_failure_count(&guard), 0);
        assert_eq!(f.tracker.node_failure_count(&relay), 0);
    }

    #[tokio::test]
    async fn test_redirect_replaces_or_drops() {
        let f = fixture(15).await;
        f.swarms.update_swarm("bob", &make_nodes(0..3)).unwrap();

        let replacement = make_nodes(5..8);
        f.tracker
            .on_redirect("bob", Some(&replacement), make_node(0).id())
            .unwrap();
        assert_eq!(
            f.swarms.members("bob").unwrap(),
            replacement.iter().map(|n| *n.id()).collect::<Vec<_>>()
        );

        f.tracker.on_redirect("bob", None, make_node(6).id()).unwrap();
        assert_eq!(f.swarms.members("bob").unwrap().len(), 2);
        assert!(!f.swarms.members("bob").unwrap().contains(make_node(6).id()));
    }
}
