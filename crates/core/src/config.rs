//! Routing configuration
//!
//! Every field has a default, so a JSON file only needs to carry what it
//! overrides. Durations are expressed in milliseconds on disk.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RouteError, Result};
use crate::types::SeedNode;

/// Exponential backoff for node-list and swarm lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry (milliseconds)
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 4,
            base_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            factor: 2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_base_backoff_ms(mut self, ms: u64) -> Self {
        self.base_backoff_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor;
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    #[must_use]
    pub fn compute_backoff_ms(&self, attempt: u32) -> u64 {
        let growth = u64::from(self.factor.max(1)).saturating_pow(attempt.min(30));
        self.base_backoff_ms.saturating_mul(growth).min(self.max_backoff_ms)
    }

    /// Delay before the next retry, or `None` once retries are spent
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.retries {
            return None;
        }
        Some(Duration::from_millis(self.compute_backoff_ms(attempt)))
    }
}

/// Tunables for the routing layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Nodes per path, guard included
    pub path_length: usize,
    /// Guards kept at any time (one path per guard)
    pub guard_count: usize,
    /// Valid paths required before `get_path` stops rebuilding
    pub min_paths: usize,
    /// Smallest pool that may be refreshed by consensus
    pub min_pool: usize,
    /// Nodes all consensus views must agree on
    pub required_agreement: usize,
    /// Nodes asked for their view during consensus refresh
    pub consensus_query_count: usize,
    /// Live members a cached swarm must keep to be trusted
    pub min_swarm: usize,
    /// Attributed failures before a node is evicted
    pub node_failure_threshold: u32,
    /// Failures before a path and its guard are dropped
    pub path_failure_threshold: u32,
    /// Rebuild attempts `get_path` makes before giving up
    pub max_path_build_attempts: u32,
    /// Paths tried by one onion fetch
    pub onion_fetch_attempts: u32,
    /// Keep at most one eligible relay per IPv4 /24
    pub distinct_subnets: bool,

    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub node_list_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub onion_request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub seed_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long a dispatched message hash is remembered
    #[serde(with = "duration_ms")]
    pub seen_hash_ttl: Duration,

    /// Backoff for consensus and seed node-list fetches
    pub node_list_retry: RetryPolicy,
    /// Backoff for swarm lookups
    pub swarm_lookup_retry: RetryPolicy,

    pub seed_nodes: Vec<SeedNode>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            path_length: 3,
            guard_count: 3,
            min_paths: 2,
            min_pool: 12,
            required_agreement: 24,
            consensus_query_count: 3,
            min_swarm: 3,
            node_failure_threshold: 3,
            path_failure_threshold: 3,
            max_path_build_attempts: 10,
            onion_fetch_attempts: 4,
            distinct_subnets: true,
            health_check_timeout: Duration::from_secs(10),
            node_list_timeout: Duration::from_secs(5),
            onion_request_timeout: Duration::from_secs(25),
            seed_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            seen_hash_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            node_list_retry: RetryPolicy::default(),
            swarm_lookup_retry: RetryPolicy::default()
                .with_retries(3)
                .with_base_backoff_ms(100)
                .with_max_backoff_ms(4_000),
            seed_nodes: Vec::new(),
        }
    }
}

impl RoutingConfig {
    /// Load a JSON config file, filling unspecified fields with defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| RouteError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| RouteError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values the routing algorithms rely on
    pub fn validate(&self) -> Result<()> {
        if self.path_length < 2 {
            return Err(RouteError::Config("path_length must be at least 2".into()));
        }
        for (name, value) in [
            ("guard_count", self.guard_count),
            ("min_paths", self.min_paths),
            ("min_swarm", self.min_swarm),
            ("required_agreement", self.required_agreement),
            ("consensus_query_count", self.consensus_query_count),
        ] {
            if value == 0 {
                return Err(RouteError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.node_failure_threshold == 0 || self.path_failure_threshold == 0 {
            return Err(RouteError::Config("failure thresholds must be at least 1".into()));
        }
        if self.max_path_build_attempts == 0 || self.onion_fetch_attempts == 0 {
            return Err(RouteError::Config("attempt counters must be at least 1".into()));
        }
        Ok(())
    }

    /// Relays after the guard on each path
    pub fn relays_per_path(&self) -> usize {
        self.path_length.saturating_sub(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
