//! SwarmRoute Client
//!
//! Onion-routed access to a swarm-based storage network.
//!
//! ## Overview
//!
//! A [`RoutingContext`] owns every routing component:
//! - the [`NodePool`] of known service nodes, refreshed by consensus or from seeds
//! - the [`SwarmDirectory`] mapping identities to the nodes that hold their messages
//! - the [`GuardSelector`] and [`PathBuilder`] that maintain onion paths
//! - the [`FailureTracker`] that evicts misbehaving nodes and paths
//!
//! The [`SwarmPoller`] sits on top and feeds retrieved messages to a
//! [`MessageDispatcher`].
//!
//! ## Example
//!
//! ```ignore
//! use swarmroute_client::RoutingContext;
//! use swarmroute_core::{MemoryStore, RoutingConfig};
//! use swarmroute_network::HttpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! let ctx = RoutingContext::new(
//!     RoutingConfig::default(),
//!     Arc::new(HttpTransport::new()?),
//!     Arc::new(MemoryStore::new()),
//! )?;
//! ctx.build_paths().await?;
//!
//! let swarm = ctx.get_swarm("05abcd...", &CancellationToken::new()).await?;
//! println!("{} swarm members", swarm.len());
//! ```

mod coalesce;
mod context;
mod failure;
mod guard;
mod onion;
mod path;
mod poller;
mod pool;
mod retry;
mod rpc;
mod swarm;

#[cfg(test)]
mod test_support;

pub use coalesce::SingleFlight;
pub use context::RoutingContext;
pub use failure::FailureTracker;
pub use guard::GuardSelector;
pub use onion::{decode, encode, send, Destination, EncodedOnion};
pub use path::{PathBuilder, RepairOutcome};
pub use poller::{MessageDispatcher, PolledIdentity, SwarmPoller, SATURATED_BATCH};
pub use pool::NodePool;
pub use retry::retry_with_backoff;
pub use swarm::SwarmDirectory;
