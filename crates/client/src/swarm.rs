//! Swarm directory: which nodes hold each identity's messages

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use swarmroute_core::{Node, NodeId, Result, RoutingConfig, RoutingStore};
use tracing::{debug, info};

use crate::pool::NodePool;
use crate::retry::retry_with_backoff;

/// Cached and persisted swarm membership, keyed by identity
pub struct SwarmDirectory {
    config: Arc<RoutingConfig>,
    pool: NodePool,
    store: Arc<dyn RoutingStore>,
    cache: RwLock<HashMap<String, Vec<NodeId>>>,
}

impl SwarmDirectory {
    pub fn new(config: Arc<RoutingConfig>, pool: NodePool, store: Arc<dyn RoutingStore>) -> Self {
        Self {
            config,
            pool,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Recorded members, loading from the store on first use
    pub fn members(&self, identity: &str) -> Result<Vec<NodeId>> {
        if let Some(members) = self.cache.read().get(identity) {
            return Ok(members.clone());
        }

        let members = self.store.swarm(identity)?.unwrap_or_default();
        self.cache
            .write()
            .entry(identity.to_string())
            .or_insert_with(|| members.clone());
        Ok(members)
    }

    /// Recorded members that are still in the node pool
    pub fn live_members(&self, identity: &str) -> Result<Vec<Node>> {
        Ok(self
            .members(identity)?
            .iter()
            .filter_map(|id| self.pool.get(id))
            .collect())
    }

    /// Members of `identity`'s swarm.
    ///
    /// Uses the recorded list while it has at least `min_swarm` live
    /// members; otherwise asks the network through `fetch` (with backoff),
    /// records the answer and returns it.
    pub async fn get_swarm<F, Fut>(&self, identity: &str, fetch: F) -> Result<Vec<Node>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Vec<Node>>>,
    {
        let live = self.live_members(identity)?;
        if live.len() >= self.config.min_swarm {
            return Ok(live);
        }

        debug!(
            "Swarm for {} has {} live members, fetching from network",
            identity,
            live.len()
        );
        let fetched = retry_with_backoff("swarm lookup", &self.config.swarm_lookup_retry, fetch).await?;
        self.update_swarm(identity, &fetched)?;
        Ok(fetched)
    }

    /// Replace the member list wholesale
    pub fn update_swarm(&self, identity: &str, members: &[Node]) -> Result<()> {
        let ids: Vec<NodeId> = members.iter().map(|n| *n.id()).collect();
        self.store.replace_swarm(identity, &ids)?;
        info!("Swarm for {} updated: {} members", identity, ids.len());
        self.cache.write().insert(identity.to_string(), ids);
        Ok(())
    }

    /// Remove one member; returns whether it was present
    pub fn drop_member(&self, identity: &str, node: &NodeId) -> Result<bool> {
        let mut members = self.members(identity)?;
        let before = members.len();
        members.retain(|id| id != node);
        if members.len() == before {
            return Ok(false);
        }

        self.store.replace_swarm(identity, &members)?;
        debug!("Dropped {} from swarm of {}", node.short(), identity);
        self.cache.write().insert(identity.to_string(), members);
        Ok(true)
    }

    /// Forget an identity's swarm entirely
    pub fn remove(&self, identity: &str) -> Result<()> {
        self.store.delete_swarm(identity)?;
        self.cache.write().remove(identity);
        Ok(())
    }
}
