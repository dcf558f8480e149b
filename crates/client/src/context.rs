//! The routing context: one value owning every routing component

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use swarmroute_core::{NodeId, OnionPath, Result, RoutingConfig, RoutingStore};
use swarmroute_crypto::SigningKeypair;
use swarmroute_network::NodeTransport;
use tracing::info;

use crate::failure::FailureTracker;
use crate::guard::GuardSelector;
use crate::path::PathBuilder;
use crate::pool::NodePool;
use crate::swarm::SwarmDirectory;

/// Cheaply cloneable handle shared by every caller
#[derive(Clone)]
pub struct RoutingContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Arc<RoutingConfig>,
    transport: Arc<dyn NodeTransport>,
    store: Arc<dyn RoutingStore>,
    pool: NodePool,
    swarms: Arc<SwarmDirectory>,
    guards: Arc<GuardSelector>,
    paths: PathBuilder,
    failures: FailureTracker,
    /// Signing keys for identities whose retrieves must be authenticated
    signers: RwLock<HashMap<String, Arc<SigningKeypair>>>,
}

impl RoutingContext {
    /// Wire up all components, loading persisted state from `store`
    pub fn new(
        config: RoutingConfig,
        transport: Arc<dyn NodeTransport>,
        store: Arc<dyn RoutingStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = NodePool::new(config.clone(), transport.clone(), store.clone())?;
        let swarms = Arc::new(SwarmDirectory::new(config.clone(), pool.clone(), store.clone()));
        let guards = Arc::new(GuardSelector::new(
            config.clone(),
            transport.clone(),
            pool.clone(),
            store.clone(),
        ));
        let paths = PathBuilder::new(config.clone(), pool.clone(), guards.clone());
        let failures = FailureTracker::new(config.clone(), pool.clone(), swarms.clone(), paths.clone());

        info!(
            "Routing context ready: {} pooled nodes, path length {}",
            pool.len(),
            config.path_length
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                transport,
                store,
                pool,
                swarms,
                guards,
                paths,
                failures,
                signers: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &dyn NodeTransport {
        self.inner.transport.as_ref()
    }

    pub fn store(&self) -> &dyn RoutingStore {
        self.inner.store.as_ref()
    }

    pub fn pool(&self) -> &NodePool {
        &self.inner.pool
    }

    pub fn swarms(&self) -> &SwarmDirectory {
        &self.inner.swarms
    }

    pub fn guards(&self) -> &GuardSelector {
        &self.inner.guards
    }

    pub fn paths(&self) -> &PathBuilder {
        &self.inner.paths
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.inner.failures
    }

    /// Sign retrieves for `identity` with `keypair` from now on
    pub fn register_signing_key(&self, identity: impl Into<String>, keypair: SigningKeypair) {
        self.inner
            .signers
            .write()
            .insert(identity.into(), Arc::new(keypair));
    }

    pub fn signer(&self, identity: &str) -> Option<Arc<SigningKeypair>> {
        self.inner.signers.read().get(identity).cloned()
    }

    pub async fn refresh_pool(&self) -> Result<usize> {
        self.inner.pool.refresh().await
    }

    pub async fn build_paths(&self) -> Result<usize> {
        self.inner.paths.build().await
    }

    pub async fn get_path(&self, exclude: Option<&NodeId>) -> Result<OnionPath> {
        self.inner.paths.get_path(exclude).await
    }
}
