//! Fixtures shared by the unit tests of this crate

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use swarmroute_core::{
    MemoryStore, Node, NodeId, RetryPolicy, RoutingConfig, RoutingStore, SeedNode,
};
use swarmroute_crypto::{EncryptionKeypair, SigningKeypair};
use swarmroute_network::{
    HttpReply, NodeTransport, TransportError, ONION_ENDPOINT, RPC_ENDPOINT,
};

fn secret_for(n: u16, domain: u8) -> [u8; 32] {
    let mut secret = [domain; 32];
    secret[..2].copy_from_slice(&n.to_le_bytes());
    secret
}

pub(crate) fn signing_keypair(n: u16) -> SigningKeypair {
    SigningKeypair::from_secret_bytes(&secret_for(n, 0x5a))
}

pub(crate) fn encryption_keypair(n: u16) -> EncryptionKeypair {
    EncryptionKeypair::from_secret_bytes(secret_for(n, 0xa5))
}

/// Deterministic node `n`, alone in its /24
pub(crate) fn make_node(n: u16) -> Node {
    Node {
        ip: format!("10.{}.{}.1", n / 256, n % 256),
        port: 22021,
        pubkey_x25519: encryption_keypair(n).public_key_bytes(),
        pubkey_ed25519: NodeId::from_bytes(signing_keypair(n).public_key_bytes()),
        version: "2.8.0".into(),
    }
}

pub(crate) fn make_nodes(range: std::ops::Range<u16>) -> Vec<Node> {
    range.map(make_node).collect()
}

/// Defaults with millisecond backoff so failure paths finish quickly
pub(crate) fn test_config() -> RoutingConfig {
    let fast = RetryPolicy::default()
        .with_retries(1)
        .with_base_backoff_ms(1)
        .with_max_backoff_ms(2);
    RoutingConfig {
        node_list_retry: fast,
        swarm_lookup_retry: fast,
        health_check_timeout: Duration::from_millis(200),
        onion_request_timeout: Duration::from_millis(500),
        seed_nodes: vec![SeedNode::new("https://seed.test")],
        ..RoutingConfig::default()
    }
}

pub(crate) fn store_with_pool(nodes: &[Node]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.replace_node_pool(nodes).unwrap();
    store
}

pub(crate) fn node_list_body(nodes: &[Node]) -> Vec<u8> {
    let states: Vec<Value> = nodes
        .iter()
        .map(|n| {
            json!({
                "public_ip": n.ip,
                "storage_port": n.port,
                "pubkey_x25519": hex::encode(n.pubkey_x25519),
                "pubkey_ed25519": n.pubkey_ed25519.to_string(),
            })
        })
        .collect();
    serde_json::to_vec(&json!({ "result": { "service_node_states": states } })).unwrap()
}

type OnionHandler = Box<dyn Fn(&Node, &[u8]) -> Result<HttpReply, TransportError> + Send + Sync>;

/// Scripted transport: node lists per node, a seed list, unhealthy nodes
/// for `info` health checks and an optional onion handler.
#[derive(Default)]
pub(crate) struct MockTransport {
    node_lists: Mutex<HashMap<NodeId, Vec<Node>>>,
    default_node_list: Mutex<Option<Vec<Node>>>,
    seed_nodes: Mutex<Vec<Node>>,
    unhealthy: Mutex<HashSet<NodeId>>,
    onion_handler: Mutex<Option<Arc<OnionHandler>>>,
    onion_delay: Mutex<Option<Duration>>,
    pub node_list_calls: AtomicUsize,
    pub seed_calls: AtomicUsize,
    pub health_checks: AtomicUsize,
    pub onion_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed_nodes(self, nodes: Vec<Node>) -> Self {
        *self.seed_nodes.lock() = nodes;
        self
    }

    pub fn set_node_list(&self, node: &NodeId, view: Vec<Node>) {
        self.node_lists.lock().insert(*node, view);
    }

    pub fn set_default_node_list(&self, view: Vec<Node>) {
        *self.default_node_list.lock() = Some(view);
    }

    pub fn mark_unhealthy(&self, node: &NodeId) {
        self.unhealthy.lock().insert(*node);
    }

    pub fn set_onion_handler<F>(&self, handler: F)
    where
        F: Fn(&Node, &[u8]) -> Result<HttpReply, TransportError> + Send + Sync + 'static,
    {
        *self.onion_handler.lock() = Some(Arc::new(Box::new(handler)));
    }

    pub fn set_onion_delay(&self, delay: Duration) {
        *self.onion_delay.lock() = Some(delay);
    }

    fn answer_rpc(&self, node: &Node, body: &[u8]) -> HttpReply {
        let method = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_default();
        match method.as_str() {
            "info" => {
                self.health_checks.fetch_add(1, Ordering::SeqCst);
                if self.unhealthy.lock().contains(node.id()) {
                    HttpReply::new(503, "unavailable")
                } else {
                    HttpReply::ok(r#"{"version":[2,8,0],"timestamp":0}"#)
                }
            }
            "oxend_request" => {
                self.node_list_calls.fetch_add(1, Ordering::SeqCst);
                let view = self
                    .node_lists
                    .lock()
                    .get(node.id())
                    .cloned()
                    .or_else(|| self.default_node_list.lock().clone());
                match view {
                    Some(view) => HttpReply::ok(node_list_body(&view)),
                    None => HttpReply::new(503, "no view"),
                }
            }
            other => HttpReply::new(400, format!("unexpected method {}", other)),
        }
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn post_to_node(
        &self,
        node: &Node,
        endpoint: &str,
        body: Vec<u8>,
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        match endpoint {
            RPC_ENDPOINT => Ok(self.answer_rpc(node, &body)),
            ONION_ENDPOINT => {
                self.onion_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *self.onion_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let handler = self.onion_handler.lock().clone();
                match handler {
                    Some(handler) => handler(node, &body),
                    None => Ok(HttpReply::new(502, "no handler")),
                }
            }
            other => Ok(HttpReply::new(404, format!("unknown endpoint {}", other))),
        }
    }

    async fn post_to_seed(
        &self,
        _seed: &SeedNode,
        _url: &str,
        _body: Vec<u8>,
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        let nodes = self.seed_nodes.lock().clone();
        if nodes.is_empty() {
            Ok(HttpReply::new(503, "seed down"))
        } else {
            Ok(HttpReply::ok(node_list_body(&nodes)))
        }
    }
}
