//! SwarmRoute Core
//!
//! Shared vocabulary for the routing layer:
//!
//! - [`Node`], [`NodeId`] and [`OnionPath`]
//! - [`RoutingConfig`] with the pool, guard, path and failure thresholds
//! - the onion error taxonomy ([`OnionError`]) and [`RouteError`]
//! - the [`RoutingStore`] persistence collaborator and an in-memory implementation

mod config;
mod error;
mod store;
mod types;

pub use config::{RetryPolicy, RoutingConfig};
pub use error::{Fault, OnionError, Result, RouteError, StoreError};
pub use store::{MemoryStore, RoutingStore, StoreResult, StoreState};
pub use types::{
    now_ms, LastHash, Node, NodeId, OnionPath, ParseNodeIdError, PublicKey, SeedNode, SeenHash,
    PLACEHOLDER_IP,
};
