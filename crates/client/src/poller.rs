//! Swarm poller
//!
//! Periodically retrieves new messages for every tracked identity from one
//! member of its swarm and hands each unseen message to a dispatcher.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use swarmroute_core::{now_ms, LastHash, NodeId, Result, RouteError, SeenHash};
use swarmroute_network::RetrievedMessage;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RoutingContext;

/// A retrieve returning at least this many messages probably left more behind
pub const SATURATED_BATCH: usize = 95;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const ACTIVE_WINDOW_MS: u64 = 2 * DAY_MS;
const MEDIUM_WINDOW_MS: u64 = 7 * DAY_MS;
const MEDIUM_PERIOD: Duration = Duration::from_secs(60);
const INACTIVE_PERIOD: Duration = Duration::from_secs(120);

/// Receives every newly retrieved message
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, identity: &str, message: RetrievedMessage);
}

/// Polling state of one identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolledIdentity {
    /// Last time the identity was used, unix ms; `None` polls every cycle
    pub last_active_ms: Option<u64>,
    pub last_polled_ms: Option<u64>,
    /// Swarm member polled last time
    pub node: Option<NodeId>,
    /// Poll on the next cycle regardless of tier
    pub due: bool,
}

impl PolledIdentity {
    /// Minimum time between polls for this identity's activity tier
    pub fn poll_period(&self, now_ms: u64) -> Duration {
        match self.last_active_ms {
            None => Duration::ZERO,
            Some(active) => match now_ms.saturating_sub(active) {
                age if age <= ACTIVE_WINDOW_MS => Duration::ZERO,
                age if age <= MEDIUM_WINDOW_MS => MEDIUM_PERIOD,
                _ => INACTIVE_PERIOD,
            },
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        if self.due {
            return true;
        }
        let period = self.poll_period(now_ms).as_millis() as u64;
        self.last_polled_ms
            .map_or(true, |polled| now_ms.saturating_sub(polled) >= period)
    }
}

pub struct SwarmPoller {
    ctx: RoutingContext,
    dispatcher: Arc<dyn MessageDispatcher>,
    identities: Mutex<BTreeMap<String, PolledIdentity>>,
}

impl SwarmPoller {
    pub fn new(ctx: RoutingContext, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        Self {
            ctx,
            dispatcher,
            identities: Mutex::new(BTreeMap::new()),
        }
    }

    /// Track `identity`; already tracked identities keep their state
    pub fn add_identity(&self, identity: &str) {
        self.identities
            .lock()
            .entry(identity.to_string())
            .or_default();
    }

    /// Track `identity` and record when it was last active
    pub fn add_identity_with_activity(&self, identity: &str, last_active_ms: u64) {
        self.identities
            .lock()
            .entry(identity.to_string())
            .or_default()
            .last_active_ms = Some(last_active_ms);
    }

    /// Stop tracking `identity` and forget its cursors
    pub fn remove_identity(&self, identity: &str) -> bool {
        let removed = self.identities.lock().remove(identity).is_some();
        if removed {
            if let Err(e) = self.ctx.store().delete_last_hashes(identity) {
                warn!("Failed to delete cursors of {}: {}", identity, e);
            }
        }
        removed
    }

    pub fn identities(&self) -> Vec<String> {
        self.identities.lock().keys().cloned().collect()
    }

    pub fn state(&self, identity: &str) -> Option<PolledIdentity> {
        self.identities.lock().get(identity).cloned()
    }

    /// Spawn the polling loop; it runs until `cancel` fires
    pub fn start(
        self: &Arc<Self>,
        identities: impl IntoIterator<Item = String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        for identity in identities {
            self.add_identity(&identity);
        }

        let poller = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.ctx.config().poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Swarm poller started for {} identities", poller.identities().len());

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        poller.poll_cycle(&cancel).await;
                    }
                }
            }
            info!("Swarm poller stopped");
        })
    }

    /// Poll every identity that is due. Failures are logged per identity
    /// and never stop the others. Returns how many messages were dispatched.
    pub async fn poll_cycle(&self, cancel: &CancellationToken) -> usize {
        let now = now_ms();
        let due: Vec<String> = self
            .identities
            .lock()
            .iter()
            .filter(|(_, state)| state.is_due(now))
            .map(|(identity, _)| identity.clone())
            .collect();

        let results = join_all(due.iter().map(|identity| self.poll_identity(identity, cancel))).await;

        let mut dispatched = 0;
        for (identity, result) in due.iter().zip(results) {
            match result {
                Ok(count) => dispatched += count,
                Err(e) if e.is_aborted() => debug!("Poll of {} aborted", identity),
                Err(e) => warn!("Polling {} failed: {}", identity, e),
            }
        }

        match self.ctx.store().prune_seen_hashes(now) {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} expired seen hashes", pruned),
            Err(e) => warn!("Failed to prune seen hashes: {}", e),
        }
        match self.ctx.store().prune_last_hashes(now) {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} expired cursors", pruned),
            Err(e) => warn!("Failed to prune cursors: {}", e),
        }
        dispatched
    }

    /// Poll `identity` right now, whatever its tier
    pub async fn poll_once(&self, identity: &str) -> Result<usize> {
        self.add_identity(identity);
        self.poll_identity(identity, &CancellationToken::new()).await
    }

    async fn poll_identity(&self, identity: &str, cancel: &CancellationToken) -> Result<usize> {
        let swarm = self.ctx.get_swarm(identity, cancel).await?;

        let previous = self.identities.lock().get(identity).and_then(|s| s.node);
        let node = match previous.and_then(|id| swarm.iter().find(|n| *n.id() == id).cloned()) {
            Some(node) => node,
            None => {
                let node = swarm
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or(RouteError::InsufficientNodes { have: 0, need: 1 })?;
                self.update_state(identity, |s| s.node = Some(*node.id()));
                node
            }
        };

        let store = self.ctx.store();
        let cursor = store.last_hash(node.id(), identity, now_ms())?;
        let result = match self
            .ctx
            .retrieve_messages(identity, &node, cursor.as_ref().map(|c| c.hash.as_str()), cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                if !e.is_aborted() {
                    self.update_state(identity, |s| s.node = None);
                }
                return Err(e);
            }
        };

        let now = now_ms();
        let saturated = result.messages.len() >= SATURATED_BATCH;
        self.update_state(identity, |s| {
            s.last_polled_ms = Some(now);
            s.due = saturated;
        });

        let mut in_batch = HashSet::new();
        let messages: Vec<RetrievedMessage> = result
            .messages
            .into_iter()
            .filter(|m| in_batch.insert(m.hash.clone()))
            .collect();
        let Some(newest) = messages.last() else {
            return Ok(0);
        };
        store.replace_last_hash(
            node.id(),
            identity,
            &LastHash {
                hash: newest.hash.clone(),
                expires_at_ms: newest.expiration,
            },
        )?;

        let hashes: Vec<String> = messages.iter().map(|m| m.hash.clone()).collect();
        let seen = store.seen_hashes(&hashes)?;
        let fresh: Vec<RetrievedMessage> = messages
            .into_iter()
            .filter(|m| !seen.contains(&m.hash))
            .collect();

        let expires_at_ms = now + self.ctx.config().seen_hash_ttl.as_millis() as u64;
        let entries: Vec<SeenHash> = fresh
            .iter()
            .map(|m| SeenHash {
                hash: m.hash.clone(),
                expires_at_ms,
            })
            .collect();
        store.insert_seen_hashes(&entries)?;

        let count = fresh.len();
        for message in fresh {
            self.dispatcher.dispatch(identity, message).await;
        }
        if count > 0 {
            debug!("Dispatched {} new messages for {}", count, identity);
        }
        Ok(count)
    }

    fn update_state(&self, identity: &str, update: impl FnOnce(&mut PolledIdentity)) {
        if let Some(state) = self.identities.lock().get_mut(identity) {
            update(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 100 * DAY_MS;

    #[test]
    fn test_activity_tiers() {
        let unknown = PolledIdentity::default();
        assert_eq!(unknown.poll_period(NOW), Duration::ZERO);

        let active = PolledIdentity {
            last_active_ms: Some(NOW - DAY_MS),
            ..Default::default()
        };
        assert_eq!(active.poll_period(NOW), Duration::ZERO);

        let medium = PolledIdentity {
            last_active_ms: Some(NOW - 5 * DAY_MS),
            ..Default::default()
        };
        assert_eq!(medium.poll_period(NOW), MEDIUM_PERIOD);

        let inactive = PolledIdentity {
            last_active_ms: Some(NOW - 30 * DAY_MS),
            ..Default::default()
        };
        assert_eq!(inactive.poll_period(NOW), INACTIVE_PERIOD);
    }

    #[test]
    fn test_due_respects_tier_period() {
        let mut state = PolledIdentity {
            last_active_ms: Some(NOW - 30 * DAY_MS),
            last_polled_ms: Some(NOW - 10_000),
            ..Default::default()
        };
        assert!(!state.is_due(NOW));
        assert!(state.is_due(NOW + 120_000));

        state.due = true;
        assert!(state.is_due(NOW));
    }

    #[test]
    fn test_never_polled_is_due() {
        let state = PolledIdentity {
            last_active_ms: Some(NOW - 30 * DAY_MS),
            ..Default::default()
        };
        assert!(state.is_due(NOW));
    }
}
