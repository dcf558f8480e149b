//! Guard selection
//!
//! Guards are the first hop of every path. They are chosen from the pool,
//! health-checked with a direct `info` request and persisted so the same
//! entry points survive restarts.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use swarmroute_core::{Node, NodeId, Result, RouteError, RoutingConfig, RoutingStore};
use swarmroute_network::{NodeTransport, RpcRequest, RPC_ENDPOINT};
use tracing::{debug, info, warn};

use crate::pool::NodePool;

pub struct GuardSelector {
    config: Arc<RoutingConfig>,
    transport: Arc<dyn NodeTransport>,
    pool: NodePool,
    store: Arc<dyn RoutingStore>,
    guards: RwLock<Vec<Node>>,
}

impl GuardSelector {
    pub fn new(
        config: Arc<RoutingConfig>,
        transport: Arc<dyn NodeTransport>,
        pool: NodePool,
        store: Arc<dyn RoutingStore>,
    ) -> Self {
        Self {
            config,
            transport,
            pool,
            store,
            guards: RwLock::new(Vec::new()),
        }
    }

    pub fn guards(&self) -> Vec<Node> {
        self.guards.read().clone()
    }

    pub fn is_guard(&self, id: &NodeId) -> bool {
        self.guards.read().iter().any(|g| g.id() == id)
    }

    /// Current guards, re-resolved against the pool and topped up to
    /// `guard_count` when some have disappeared.
    pub async fn load_or_select(&self) -> Result<Vec<Node>> {
        let mut kept: Vec<Node> = self
            .guards()
            .iter()
            .filter_map(|g| self.pool.get(g.id()))
            .collect();
        if kept.is_empty() {
            kept = self
                .store
                .guard_nodes()?
                .iter()
                .filter_map(|id| self.pool.get(id))
                .collect();
            if !kept.is_empty() {
                debug!("Restored {} guards from store", kept.len());
            }
        }
        kept.truncate(self.config.guard_count);

        if kept.len() >= self.config.guard_count {
            *self.guards.write() = kept.clone();
            return Ok(kept);
        }
        self.select_from(kept).await
    }

    /// Top the current guard set up to `guard_count`
    pub async fn select(&self) -> Result<Vec<Node>> {
        self.select_from(self.guards()).await
    }

    async fn select_from(&self, existing: Vec<Node>) -> Result<Vec<Node>> {
        let needed = self.config.guard_count;
        let exclude: HashSet<NodeId> = existing.iter().map(|g| *g.id()).collect();
        let mut candidates: Vec<Node> = self
            .pool
            .snapshot()
            .iter()
            .filter(|n| !exclude.contains(n.id()))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        let mut candidates = candidates.into_iter();

        let mut selected = existing;
        while selected.len() < needed {
            let batch: Vec<Node> = candidates.by_ref().take(self.config.guard_count).collect();
            if batch.is_empty() {
                warn!("Guard selection exhausted the pool with {} of {} guards", selected.len(), needed);
                return Err(RouteError::GuardSelectionFailed {
                    found: selected.len(),
                    needed,
                });
            }

            let health = join_all(batch.iter().map(|n| self.check_health(n))).await;
            for (node, healthy) in batch.into_iter().zip(health) {
                if !healthy {
                    debug!("Guard candidate {} failed health check", node.id().short());
                } else if selected.len() < needed {
                    selected.push(node);
                }
            }
        }

        let ids: Vec<NodeId> = selected.iter().map(|g| *g.id()).collect();
        self.store.replace_guard_nodes(&ids)?;
        info!(
            "Selected guards: {}",
            ids.iter().map(NodeId::short).collect::<Vec<_>>().join(", ")
        );
        *self.guards.write() = selected.clone();
        Ok(selected)
    }

    /// Healthy means a 200 carrying a JSON body
    pub async fn check_health(&self, node: &Node) -> bool {
        let body = match RpcRequest::info().to_bytes() {
            Ok(body) => body,
            Err(_) => return false,
        };
        match self
            .transport
            .post_to_node(node, RPC_ENDPOINT, body, self.config.health_check_timeout)
            .await
        {
            Ok(reply) => {
                reply.is_success() && serde_json::from_slice::<serde_json::Value>(&reply.body).is_ok()
            }
            Err(e) => {
                debug!("Health check of {} failed: {}", node.id().short(), e);
                false
            }
        }
    }

    /// Remove one guard and persist the remaining set
    pub fn drop_guard(&self, id: &NodeId) -> Result<bool> {
        let mut guards = self.guards.write();
        let before = guards.len();
        guards.retain(|g| g.id() != id);
        if guards.len() == before {
            return Ok(false);
        }

        let ids: Vec<NodeId> = guards.iter().map(|g| *g.id()).collect();
        self.store.replace_guard_nodes(&ids)?;
        info!("Dropped guard {}", id.short());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_node, make_nodes, store_with_pool, test_config, MockTransport};
    use std::sync::atomic::Ordering;
    use swarmroute_core::MemoryStore;

    fn selector(transport: Arc<MockTransport>, store: Arc<MemoryStore>) -> GuardSelector {
        let config = Arc::new(test_config());
        let pool = NodePool::new(config.clone(), transport.clone(), store.clone()).unwrap();
        GuardSelector::new(config, transport, pool, store)
    }

    #[tokio::test]
    async fn test_selects_healthy_guards_and_persists() {
        let store = store_with_pool(&make_nodes(0..12));
        let transport = Arc::new(MockTransport::new());
        for n in 0..6 {
            transport.mark_unhealthy(make_node(n).id());
        }
        let guards = selector(transport, store.clone());

        let selected = guards.load_or_select().await.unwrap();
        assert_eq!(selected.len(), 3);
        assert!(selected.iter().all(|g| !(0..6).any(|n| make_node(n) == *g)));
        assert_eq!(store.snapshot().guard_nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_selection_fails_when_pool_exhausted() {
        let nodes = make_nodes(0..4);
        let store = store_with_pool(&nodes);
        let transport = Arc::new(MockTransport::new());
        for node in &nodes[..2] {
            transport.mark_unhealthy(node.id());
        }
        let guards = selector(transport, store.clone());

        let result = guards.select().await;
        assert!(matches!(
            result,
            Err(RouteError::GuardSelectionFailed { found: 2, needed: 3 })
        ));
        assert!(guards.guards().is_empty());
        assert!(store.snapshot().guard_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_stored_guards_restored_and_topped_up() {
        let store = store_with_pool(&make_nodes(0..12));
        // One stored guard is no longer in the pool
        store
            .replace_guard_nodes(&[*make_node(1).id(), *make_node(2).id(), *make_node(40).id()])
            .unwrap();
        let transport = Arc::new(MockTransport::new());
        let guards = selector(transport.clone(), store);

        let selected = guards.load_or_select().await.unwrap();
        assert_eq!(selected.len(), 3);
        assert!(guards.is_guard(make_node(1).id()));
        assert!(guards.is_guard(make_node(2).id()));
        assert!(!guards.is_guard(make_node(40).id()));
        // only the replacement batch was checked
        assert_eq!(transport.health_checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_full_stored_set_needs_no_health_checks() {
        let store = store_with_pool(&make_nodes(0..12));
        store
            .replace_guard_nodes(&[*make_node(1).id(), *make_node(2).id(), *make_node(3).id()])
            .unwrap();
        let transport = Arc::new(MockTransport::new());
        let guards = selector(transport.clone(), store);

        guards.load_or_select().await.unwrap();
        assert_eq!(transport.health_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_guard_persists() {
        let store = store_with_pool(&make_nodes(0..12));
        let guards = selector(Arc::new(MockTransport::new()), store.clone());
        let selected = guards.load_or_select().await.unwrap();

        assert!(guards.drop_guard(selected[0].id()).unwrap());
        assert!(!guards.drop_guard(selected[0].id()).unwrap());
        assert_eq!(store.snapshot().guard_nodes.len(), 2);
    }
}
