//! Node pool: the client's view of the service node population
//!
//! Readers get an `Arc` snapshot; every mutation builds a new list, persists
//! it and swaps the snapshot, so nobody observes a half-written pool.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use rand::seq::{IteratorRandom, SliceRandom};
use swarmroute_core::{Node, NodeId, Result, RouteError, RoutingConfig, RoutingStore, SeedNode};
use swarmroute_network::{fetch_nodes_from_node, fetch_nodes_from_seed, NodeTransport};
use tracing::{debug, info, warn};

use crate::coalesce::SingleFlight;
use crate::retry::retry_with_backoff;

/// Shared handle to the node pool
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<RoutingConfig>,
    transport: Arc<dyn NodeTransport>,
    store: Arc<dyn RoutingStore>,
    nodes: RwLock<Arc<Vec<Node>>>,
    refresh: SingleFlight<usize>,
}

impl NodePool {
    /// Create the pool, starting from whatever the store holds
    pub fn new(
        config: Arc<RoutingConfig>,
        transport: Arc<dyn NodeTransport>,
        store: Arc<dyn RoutingStore>,
    ) -> Result<Self> {
        let stored = dedup_nodes(store.node_pool()?);
        if !stored.is_empty() {
            debug!("Loaded {} nodes from store", stored.len());
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                transport,
                store,
                nodes: RwLock::new(Arc::new(stored)),
                refresh: SingleFlight::new("node pool refresh"),
            }),
        })
    }

    pub fn snapshot(&self) -> Arc<Vec<Node>> {
        self.inner.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.read().is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.nodes.read().iter().any(|n| n.id() == id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.inner.nodes.read().iter().find(|n| n.id() == id).cloned()
    }

    /// Replace the whole pool. Fails without mutating anything when the
    /// deduplicated list is smaller than `min_pool`.
    pub fn replace(&self, nodes: Vec<Node>) -> Result<usize> {
        self.inner.replace(nodes)
    }

    /// Remove one node; removing an absent node is a no-op
    pub fn drop_node(&self, id: &NodeId) -> Result<bool> {
        Ok(self.drop_nodes(std::slice::from_ref(id))? > 0)
    }

    /// Remove several nodes, returning how many were present
    pub fn drop_nodes(&self, ids: &[NodeId]) -> Result<usize> {
        let mut nodes = self.inner.nodes.write();
        let remaining: Vec<Node> = nodes
            .iter()
            .filter(|n| !ids.contains(n.id()))
            .cloned()
            .collect();
        let removed = nodes.len() - remaining.len();
        if removed == 0 {
            return Ok(0);
        }

        self.inner.store.replace_node_pool(&remaining)?;
        *nodes = Arc::new(remaining);
        debug!("Dropped {} nodes from pool, {} remain", removed, nodes.len());
        Ok(removed)
    }

    /// Uniformly random node outside `exclude`, refreshing an empty pool first
    pub async fn get_random(&self, exclude: &HashSet<NodeId>) -> Result<Node> {
        if self.is_empty() {
            self.refresh().await?;
        }

        let nodes = self.snapshot();
        pick_random(&nodes, exclude).ok_or(RouteError::InsufficientNodes {
            have: 0,
            need: 1,
        })
    }

    /// Rebuild the pool from the network.
    ///
    /// Concurrent callers share one in-flight refresh. Returns the new size.
    pub async fn refresh(&self) -> Result<usize> {
        let inner = self.inner.clone();
        self.inner.refresh.run(move || refresh_pool(inner)).await
    }

    /// Refresh only when the pool is below `min_pool`
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.len() >= self.inner.config.min_pool {
            return Ok(());
        }
        self.refresh().await.map(|_| ())
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.is_running()
    }
}

impl PoolInner {
    fn replace(&self, nodes: Vec<Node>) -> Result<usize> {
        let nodes = dedup_nodes(nodes);
        if nodes.len() < self.config.min_pool {
            return Err(RouteError::InsufficientNodes {
                have: nodes.len(),
                need: self.config.min_pool,
            });
        }

        self.store.replace_node_pool(&nodes)?;
        let len = nodes.len();
        *self.nodes.write() = Arc::new(nodes);
        Ok(len)
    }
}

async fn refresh_pool(inner: Arc<PoolInner>) -> Result<usize> {
    let current = inner.nodes.read().clone();

    let mut consensus_error = None;
    if current.len() >= inner.config.min_pool {
        match consensus_view(&inner, &current).await {
            Ok(agreed) => {
                let len = inner.replace(agreed)?;
                info!("Node pool refreshed by consensus: {} nodes", len);
                return Ok(len);
            }
            Err(e) => {
                warn!("Consensus refresh failed: {}", e);
                consensus_error = Some(e);
            }
        }
    }

    match seed_view(&inner).await.and_then(|nodes| inner.replace(nodes)) {
        Ok(len) => {
            info!("Node pool bootstrapped from seed: {} nodes", len);
            Ok(len)
        }
        Err(e) => {
            warn!("Seed bootstrap failed: {}", e);
            Err(consensus_error.unwrap_or(e))
        }
    }
}

/// Ask a sample of known nodes for their node lists and keep the entries
/// every one of them reports.
async fn consensus_view(inner: &PoolInner, current: &[Node]) -> Result<Vec<Node>> {
    let sample = sample_nodes(current, inner.config.consensus_query_count);
    let transport = inner.transport.as_ref();
    let timeout = inner.config.node_list_timeout;
    let policy = &inner.config.node_list_retry;

    let views = join_all(sample.iter().map(|node| {
        retry_with_backoff("node list", policy, move |_| {
            fetch_nodes_from_node(transport, node, timeout)
        })
    }))
    .await;
    let views = views.into_iter().collect::<Result<Vec<_>>>()?;

    let agreed = intersect_views(views);
    if agreed.len() < inner.config.required_agreement {
        return Err(RouteError::ConsensusFailed {
            agreed: agreed.len(),
            required: inner.config.required_agreement,
        });
    }
    debug!("{} nodes agreed across {} views", agreed.len(), sample.len());
    Ok(agreed)
}

async fn seed_view(inner: &PoolInner) -> Result<Vec<Node>> {
    let seed = choose_seed(&inner.config.seed_nodes)
        .ok_or_else(|| RouteError::SeedUnavailable("no seed nodes configured".into()))?;
    let seed = &seed;
    let transport = inner.transport.as_ref();
    let timeout = inner.config.seed_timeout;

    retry_with_backoff("seed bootstrap", &inner.config.node_list_retry, move |_| {
        fetch_nodes_from_seed(transport, seed, timeout)
    })
    .await
}

/// Entries of the first view present (by address) in every other view
pub(crate) fn intersect_views(views: Vec<Vec<Node>>) -> Vec<Node> {
    let mut views = views.into_iter();
    let Some(first) = views.next() else {
        return Vec::new();
    };
    let others: Vec<HashSet<String>> = views
        .map(|view| view.iter().map(Node::address).collect())
        .collect();

    first
        .into_iter()
        .filter(|n| {
            let address = n.address();
            others.iter().all(|view| view.contains(&address))
        })
        .collect()
}

/// Drop placeholders and repeated identities, keeping first occurrences
pub(crate) fn dedup_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|n| !n.is_placeholder() && seen.insert(*n.id()))
        .collect()
}

pub(crate) fn pick_random(nodes: &[Node], exclude: &HashSet<NodeId>) -> Option<Node> {
    nodes
        .iter()
        .filter(|n| !exclude.contains(n.id()))
        .choose(&mut rand::thread_rng())
        .cloned()
}

fn sample_nodes(nodes: &[Node], count: usize) -> Vec<Node> {
    nodes
        .choose_multiple(&mut rand::thread_rng(), count)
        .cloned()
        .collect()
}

fn choose_seed(seeds: &[SeedNode]) -> Option<SeedNode> {
    seeds.choose(&mut rand::thread_rng()).cloned()
}
