//! Seed and node-list sources
//!
//! Seeds are certificate-pinned HTTPS endpoints used only when the node
//! pool has to be rebuilt from nothing. Once a pool exists, node lists
//! come from the nodes themselves.

use std::time::Duration;

use swarmroute_core::{Node, RouteError, SeedNode};
use tracing::{debug, warn};

use crate::protocol::{parse_service_node_list, RpcRequest, RPC_ENDPOINT, SEED_ENDPOINT};
use crate::transport::NodeTransport;

/// Seeds compiled into the client.
///
/// Format: `<url>[|<fallback url>]`
pub const DEFAULT_SEED_NODES: &[&str] = &[];

/// Default storage RPC port
pub const DEFAULT_PORT: u16 = 22021;

/// Parse the default seed list
pub fn default_seed_nodes() -> Vec<SeedNode> {
    let seeds = parse_seed_nodes(DEFAULT_SEED_NODES);
    if seeds.is_empty() {
        warn!("No seed nodes configured, bootstrap requires --seed or a config file");
    }
    seeds
}

/// Parse seeds from a list of `url[|fallback]` strings
pub fn parse_seed_nodes(entries: &[&str]) -> Vec<SeedNode> {
    entries.iter().filter_map(|s| parse_seed_entry(s)).collect()
}

/// Parse a single seed
///
/// Expected format: `https://seed.example:4443|https://seed.example`
pub fn parse_seed_entry(entry: &str) -> Option<SeedNode> {
    let mut parts = entry.split('|').map(str::trim);
    let url = parts.next().filter(|u| is_http_url(u))?;
    let mut seed = SeedNode::new(url.trim_end_matches('/'));
    if let Some(fallback) = parts.next() {
        if !is_http_url(fallback) {
            return None;
        }
        seed = seed.with_fallback(fallback.trim_end_matches('/'));
    }
    if parts.next().is_some() {
        return None;
    }
    Some(seed)
}

fn is_http_url(s: &str) -> bool {
    s.strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .is_some_and(|rest| !rest.is_empty())
}

/// Check if any seed is usable
pub fn has_seed_nodes(seeds: &[SeedNode]) -> bool {
    seeds.iter().any(|s| !s.url.is_empty())
}

/// Fetch the node population from one seed, trying its fallback address
/// when the primary fails. An empty filtered list counts as a failure.
pub async fn fetch_nodes_from_seed(
    transport: &dyn NodeTransport,
    seed: &SeedNode,
    timeout: Duration,
) -> Result<Vec<Node>, RouteError> {
    let body = RpcRequest::get_n_service_nodes()
        .to_bytes()
        .map_err(|e| RouteError::InvalidResponse(e.to_string()))?;

    let mut last_error = String::from("no seed address");
    for base in seed.urls() {
        let url = format!("{}{}", base, SEED_ENDPOINT);
        match transport.post_to_seed(seed, &url, body.clone(), timeout).await {
            Ok(reply) if reply.is_success() => match parse_service_node_list(&reply.body) {
                Ok(nodes) if !nodes.is_empty() => {
                    debug!("Seed {} returned {} nodes", base, nodes.len());
                    return Ok(nodes);
                }
                Ok(_) => last_error = format!("{} returned no usable nodes", base),
                Err(e) => last_error = format!("{}: {}", base, e),
            },
            Ok(reply) => last_error = format!("{} answered {}", base, reply.status),
            Err(e) => last_error = format!("{}: {}", base, e),
        }
        warn!("Seed fetch failed: {}", last_error);
    }

    Err(RouteError::SeedUnavailable(last_error))
}

/// Ask one node for its view of the network
pub async fn fetch_nodes_from_node(
    transport: &dyn NodeTransport,
    node: &Node,
    timeout: Duration,
) -> Result<Vec<Node>, RouteError> {
    let body = RpcRequest::get_service_nodes()
        .to_bytes()
        .map_err(|e| RouteError::InvalidResponse(e.to_string()))?;

    let reply = transport
        .post_to_node(node, RPC_ENDPOINT, body, timeout)
        .await
        .map_err(|e| RouteError::Transport(format!("{}: {}", node.pubkey_ed25519.short(), e)))?;
    if !reply.is_success() {
        return Err(RouteError::InvalidResponse(format!(
            "{} answered {} to node-list query",
            node.pubkey_ed25519.short(),
            reply.status
        )));
    }

    parse_service_node_list(&reply.body).map_err(|e| RouteError::InvalidResponse(e.to_string()))
}
