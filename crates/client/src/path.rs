//! Onion path construction and maintenance

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::{IteratorRandom, SliceRandom};
use swarmroute_core::{Node, NodeId, OnionPath, Result, RouteError, RoutingConfig};
use tracing::{debug, info, warn};

use crate::coalesce::SingleFlight;
use crate::guard::GuardSelector;
use crate::pool::NodePool;

/// Result of patching a path around a bad node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The bad relay was swapped for a fresh node
    Repaired(OnionPath),
    /// The bad node is the guard; the path must be dropped instead
    GuardFailed,
    /// No current path has that guard, or the node is not on it
    NotFound,
}

/// Shared handle to the current path set
#[derive(Clone)]
pub struct PathBuilder {
    inner: Arc<PathInner>,
}

struct PathInner {
    config: Arc<RoutingConfig>,
    pool: NodePool,
    guards: Arc<GuardSelector>,
    paths: RwLock<Arc<Vec<OnionPath>>>,
    generation: AtomicU64,
    build: SingleFlight<usize>,
}

impl PathBuilder {
    pub fn new(config: Arc<RoutingConfig>, pool: NodePool, guards: Arc<GuardSelector>) -> Self {
        Self {
            inner: Arc::new(PathInner {
                config,
                pool,
                guards,
                paths: RwLock::new(Arc::new(Vec::new())),
                generation: AtomicU64::new(0),
                build: SingleFlight::new("path build"),
            }),
        }
    }

    pub fn paths(&self) -> Arc<Vec<OnionPath>> {
        self.inner.paths.read().clone()
    }

    pub fn path_for_guard(&self, guard: &NodeId) -> Option<OnionPath> {
        self.inner
            .paths
            .read()
            .iter()
            .find(|p| p.guard().id() == guard)
            .cloned()
    }

    pub fn paths_containing(&self, id: &NodeId) -> Vec<OnionPath> {
        self.inner
            .paths
            .read()
            .iter()
            .filter(|p| p.contains(id))
            .cloned()
            .collect()
    }

    /// Bumped every time a build replaces the path set
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Rebuild every path from the current guards. Single-flight; returns
    /// how many paths were built.
    pub async fn build(&self) -> Result<usize> {
        let inner = self.inner.clone();
        self.inner.build.run(move || build_paths(inner)).await
    }

    /// A random path, optionally avoiding any path through `exclude`.
    ///
    /// Rebuilds while fewer than `min_paths` paths exist, at most
    /// `max_path_build_attempts` times.
    pub async fn get_path(&self, exclude: Option<&NodeId>) -> Result<OnionPath> {
        let max_attempts = self.inner.config.max_path_build_attempts;
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            let paths = self.paths();
            if paths.len() >= self.inner.config.min_paths {
                if let Some(path) = choose_path(&paths, exclude) {
                    return Ok(path);
                }
            }

            attempts += 1;
            debug!("Building paths (attempt {}/{})", attempts, max_attempts);
            if let Err(e) = self.build().await {
                warn!("Path build failed: {}", e);
                if !e.is_retryable() {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }

        // Settle for fewer than min_paths rather than nothing
        choose_path(&self.paths(), exclude).ok_or_else(|| {
            RouteError::NoPathAvailable(match last_error {
                Some(e) => format!("{} build attempts, last error: {}", attempts, e),
                None => format!("{} build attempts produced no usable path", attempts),
            })
        })
    }

    /// Swap `bad` on the path starting at `guard` for a node not used by
    /// any current path.
    pub fn repair(&self, guard: &NodeId, bad: &NodeId) -> Result<RepairOutcome> {
        let mut paths = self.inner.paths.write();
        let Some(index) = paths.iter().position(|p| p.guard().id() == guard) else {
            return Ok(RepairOutcome::NotFound);
        };
        let path = &paths[index];
        if path.guard().id() == bad {
            return Ok(RepairOutcome::GuardFailed);
        }
        if !path.contains(bad) {
            return Ok(RepairOutcome::NotFound);
        }

        let mut used: HashSet<NodeId> = paths.iter().flat_map(|p| p.nodes()).map(|n| *n.id()).collect();
        used.insert(*bad);
        used.extend(self.inner.guards.guards().iter().map(|g| *g.id()));
        let kept: Vec<&Node> = path.nodes().iter().filter(|n| n.id() != bad).collect();
        let taken_subnets: HashSet<[u8; 3]> = kept.iter().filter_map(|n| n.subnet24()).collect();
        let distinct = self.inner.config.distinct_subnets;

        let pool = self.inner.pool.snapshot();
        let fresh = pool
            .iter()
            .filter(|n| !used.contains(n.id()))
            .filter(|n| !distinct || n.subnet24().map_or(true, |s| !taken_subnets.contains(&s)))
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(RouteError::InsufficientNodes { have: 0, need: 1 })?;

        let repaired = match path.repaired(bad, fresh) {
            Some(p) => p,
            None => return Ok(RepairOutcome::NotFound),
        };
        debug!(
            "Repaired path via {}: replaced {} with {}",
            guard.short(),
            bad.short(),
            repaired.nodes()[repaired.len() - 1].id().short()
        );

        let mut next: Vec<OnionPath> = paths.iter().cloned().collect();
        next[index] = repaired.clone();
        *paths = Arc::new(next);
        Ok(RepairOutcome::Repaired(repaired))
    }

    /// Remove the path starting at `guard`, then drop the guard from the
    /// guard set and the pool.
    pub fn drop_path(&self, guard: &NodeId) -> Result<bool> {
        let removed = {
            let mut paths = self.inner.paths.write();
            let next: Vec<OnionPath> = paths
                .iter()
                .filter(|p| p.guard().id() != guard)
                .cloned()
                .collect();
            let removed = next.len() != paths.len();
            *paths = Arc::new(next);
            removed
        };

        self.inner.guards.drop_guard(guard)?;
        self.inner.pool.drop_node(guard)?;
        if removed {
            info!("Dropped path via guard {}", guard.short());
        }
        Ok(removed)
    }
}

async fn build_paths(inner: Arc<PathInner>) -> Result<usize> {
    inner.pool.ensure_ready().await?;
    let guards = inner.guards.load_or_select().await?;
    let per_path = inner.config.relays_per_path();
    let distinct = inner.config.distinct_subnets;

    let mut relays = eligible_relays(&inner.pool.snapshot(), &guards, distinct);
    if relays.len() < per_path {
        info!("Only {} eligible relays, refreshing node pool", relays.len());
        inner.pool.refresh().await?;
        relays = eligible_relays(&inner.pool.snapshot(), &guards, distinct);
    }

    let paths = assemble_paths(&guards, &relays, per_path);
    if paths.is_empty() {
        return Err(RouteError::InsufficientNodes {
            have: relays.len(),
            need: per_path,
        });
    }

    let count = paths.len();
    *inner.paths.write() = Arc::new(paths);
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    info!("Built {} onion paths (generation {})", count, generation);
    Ok(count)
}

/// Shuffled non-guard nodes. With `distinct_subnets` only one node per
/// IPv4 /24 survives, and none shares a guard's /24.
pub(crate) fn eligible_relays(pool: &[Node], guards: &[Node], distinct_subnets: bool) -> Vec<Node> {
    let guard_ids: HashSet<&NodeId> = guards.iter().map(Node::id).collect();
    let mut relays: Vec<Node> = pool
        .iter()
        .filter(|n| !guard_ids.contains(n.id()))
        .cloned()
        .collect();
    relays.shuffle(&mut rand::thread_rng());

    if !distinct_subnets {
        return relays;
    }
    let mut subnets: HashSet<[u8; 3]> = guards.iter().filter_map(Node::subnet24).collect();
    relays.retain(|n| n.subnet24().map_or(true, |s| subnets.insert(s)));
    relays
}

/// One path per guard while relays last: `min(guards, relays / per_path)`
pub(crate) fn assemble_paths(guards: &[Node], relays: &[Node], per_path: usize) -> Vec<OnionPath> {
    if per_path == 0 {
        return Vec::new();
    }
    guards
        .iter()
        .zip(relays.chunks_exact(per_path))
        .map(|(guard, chunk)| OnionPath::new(guard.clone(), chunk.to_vec()))
        .collect()
}

fn choose_path(paths: &[OnionPath], exclude: Option<&NodeId>) -> Option<OnionPath> {
    paths
        .iter()
        .filter(|p| exclude.map_or(true, |id| !p.contains(id)))
        .choose(&mut rand::thread_rng())
        .cloned()
}
