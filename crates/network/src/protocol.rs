//! Storage-node wire protocol
//!
//! Request bodies are JSON `{"method", "params"}` objects posted to
//! [`RPC_ENDPOINT`]. Onion layers use a small binary framing: a little-endian
//! `u32` ciphertext length, the ciphertext, then a UTF-8 JSON object.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use swarmroute_core::{Node, NodeId, PublicKey};
use swarmroute_crypto::is_valid_identity_key;
use thiserror::Error;

/// Storage RPC endpoint on every node
pub const RPC_ENDPOINT: &str = "/storage_rpc/v1";

/// Onion request endpoint on guard nodes
pub const ONION_ENDPOINT: &str = "/onion_req/v2";

/// JSON-RPC endpoint on seed nodes
pub const SEED_ENDPOINT: &str = "/json_rpc";

/// Body prefix a hop returns when it cannot find the next hop
pub const NEXT_NODE_NOT_FOUND_PREFIX: &str = "Next node not found: ";

pub const METHOD_INFO: &str = "info";
pub const METHOD_OXEND_REQUEST: &str = "oxend_request";
pub const METHOD_GET_SWARM: &str = "get_snodes_for_pubkey";
pub const METHOD_STORE: &str = "store";
pub const METHOD_RETRIEVE: &str = "retrieve";
pub const METHOD_GET_N_SERVICE_NODES: &str = "get_n_service_nodes";

/// Node fields requested from node-list queries
const SERVICE_NODE_FIELDS: [&str; 5] = [
    "public_ip",
    "storage_port",
    "pubkey_x25519",
    "pubkey_ed25519",
    "storage_server_version",
];

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ==================== Requests ====================

/// Request body understood by storage and seed nodes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: None,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// JSON-RPC 2.0 envelope, as seeds expect
    pub fn json_rpc(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: Some("2.0"),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Lightweight read-only request used for guard health checks
    pub fn info() -> Self {
        Self::new(METHOD_INFO, json!({}))
    }

    /// A node's view of the active service-node list
    pub fn get_service_nodes() -> Self {
        Self::new(
            METHOD_OXEND_REQUEST,
            json!({
                "endpoint": "get_service_nodes",
                "params": { "active_only": true, "fields": service_node_fields() },
            }),
        )
    }

    /// Seed bootstrap query
    pub fn get_n_service_nodes() -> Self {
        Self::json_rpc(
            METHOD_GET_N_SERVICE_NODES,
            json!({ "active_only": true, "fields": service_node_fields() }),
            0,
        )
    }

    pub fn get_swarm(identity: &str) -> Self {
        Self::new(METHOD_GET_SWARM, json!({ "pubKey": identity }))
    }

    pub fn store(params: &StoreParams) -> Self {
        Self::new(METHOD_STORE, json!(params))
    }

    pub fn retrieve(params: &RetrieveParams) -> Self {
        Self::new(METHOD_RETRIEVE, json!(params))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn service_node_fields() -> Value {
    Value::Object(
        SERVICE_NODE_FIELDS
            .iter()
            .map(|f| (f.to_string(), Value::Bool(true)))
            .collect(),
    )
}

/// Parameters of a `store` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreParams {
    pub pubkey: String,
    /// Base64 message payload
    pub data: String,
    /// Time to live in milliseconds
    pub ttl: u64,
    /// Client clock, unix milliseconds
    pub timestamp: u64,
}

/// Parameters of a `retrieve` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveParams {
    pub pubkey: String,
    /// Newest hash already retrieved from this node, empty for everything
    #[serde(default)]
    pub last_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey_ed25519: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RetrieveParams {
    pub fn new(identity: &str, last_hash: Option<&str>) -> Self {
        Self {
            pubkey: identity.to_string(),
            last_hash: last_hash.unwrap_or_default().to_string(),
            timestamp: None,
            pubkey_ed25519: None,
            signature: None,
        }
    }
}

// ==================== Responses ====================

/// Service-node record as returned by node-list queries
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceNodeRecord {
    pub public_ip: String,
    pub storage_port: u16,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
    #[serde(default)]
    pub storage_server_version: Option<Vec<u16>>,
}

impl ServiceNodeRecord {
    /// Convert to a [`Node`], dropping placeholder addresses and bad keys
    pub fn to_node(&self) -> Option<Node> {
        let version = self
            .storage_server_version
            .as_ref()
            .map(|v| v.iter().map(u16::to_string).collect::<Vec<_>>().join("."))
            .unwrap_or_default();
        build_node(
            &self.public_ip,
            self.storage_port,
            &self.pubkey_x25519,
            &self.pubkey_ed25519,
            version,
        )
    }
}

/// Swarm member record; ports arrive as strings or integers
#[derive(Debug, Clone, Deserialize)]
pub struct SwarmNodeRecord {
    pub ip: String,
    #[serde(deserialize_with = "port_from_str_or_int")]
    pub port: u16,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
}

impl SwarmNodeRecord {
    pub fn to_node(&self) -> Option<Node> {
        build_node(
            &self.ip,
            self.port,
            &self.pubkey_x25519,
            &self.pubkey_ed25519,
            String::new(),
        )
    }
}

fn port_from_str_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| serde::de::Error::custom("port out of range")),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid port: {}", other))),
    }
}

fn build_node(ip: &str, port: u16, x25519: &str, ed25519: &str, version: String) -> Option<Node> {
    let mut pubkey_x25519: PublicKey = [0u8; 32];
    hex::decode_to_slice(x25519, &mut pubkey_x25519).ok()?;
    let pubkey_ed25519: NodeId = ed25519.parse().ok()?;
    if !is_valid_identity_key(pubkey_ed25519.as_bytes()) {
        return None;
    }
    let node = Node {
        ip: ip.to_string(),
        port,
        pubkey_x25519,
        pubkey_ed25519,
        version,
    };
    (!node.is_placeholder() && port != 0).then_some(node)
}

/// Parse a node list from `{"result": {"service_node_states": [..]}}` or
/// the bare `{"service_node_states": [..]}` form.
pub fn parse_service_node_list(body: &[u8]) -> Result<Vec<Node>> {
    let value: Value = serde_json::from_slice(body)?;
    let states = value
        .get("result")
        .unwrap_or(&value)
        .get("service_node_states")
        .cloned()
        .ok_or_else(|| ProtocolError::Malformed("missing service_node_states".into()))?;
    let records: Vec<Value> = serde_json::from_value(states)?;
    Ok(records
        .into_iter()
        .filter_map(|r| serde_json::from_value::<ServiceNodeRecord>(r).ok())
        .filter_map(|r| r.to_node())
        .collect())
}

/// Parse `{"snodes": [..]}`, skipping unusable records
pub fn parse_swarm_nodes(value: &Value) -> Result<Vec<Node>> {
    let snodes = value
        .get("snodes")
        .and_then(Value::as_array)
        .ok_or_else(|| ProtocolError::Malformed("missing snodes".into()))?;
    Ok(snodes
        .iter()
        .filter_map(|r| serde_json::from_value::<SwarmNodeRecord>(r.clone()).ok())
        .filter_map(|r| r.to_node())
        .collect())
}

/// One message returned by `retrieve`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedMessage {
    pub hash: String,
    /// Base64 payload
    pub data: String,
    /// Unix milliseconds
    #[serde(default)]
    pub expiration: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrieveResult {
    #[serde(default)]
    pub messages: Vec<RetrievedMessage>,
    #[serde(default)]
    pub more: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreResult {
    #[serde(default)]
    pub hash: Option<String>,
}

/// Embedded application status, found after the last layer is removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationReply {
    pub status: u16,
    pub body: String,
}

impl DestinationReply {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Body parsed as JSON
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Parse `{"status"|"status_code": u16, "body": string|object}`
pub fn parse_destination_reply(plaintext: &[u8]) -> Result<DestinationReply> {
    let value: Value = serde_json::from_slice(plaintext)?;
    let status = value
        .get("status_code")
        .or_else(|| value.get("status"))
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| ProtocolError::Malformed("missing status".into()))?;
    let body = match value.get("body") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Ok(DestinationReply { status, body })
}

// ==================== Onion framing ====================

/// Routing instructions a hop finds next to the inner ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayInstructions {
    /// Identity of the next node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Hex x25519 key needed to open the inner ciphertext
    pub ephemeral_key: String,
}

impl RelayInstructions {
    pub fn to_node(next: &NodeId, ephemeral_key: &PublicKey) -> Self {
        Self {
            destination: Some(next.to_string()),
            ephemeral_key: hex::encode(ephemeral_key),
            ..Default::default()
        }
    }

    pub fn to_external(relay: &ExternalRelay, ephemeral_key: &PublicKey) -> Self {
        Self {
            host: Some(relay.host.clone()),
            target: Some(relay.target.clone()),
            method: Some(relay.method.clone()),
            protocol: Some(relay.protocol.clone()),
            port: Some(relay.port),
            ephemeral_key: hex::encode(ephemeral_key),
            ..Default::default()
        }
    }

    /// Instructions for the guard layer, which only needs the key
    pub fn for_guard(ephemeral_key: &PublicKey) -> Self {
        Self {
            ephemeral_key: hex::encode(ephemeral_key),
            ..Default::default()
        }
    }

    pub fn ephemeral_key_bytes(&self) -> Result<PublicKey> {
        let mut key = [0u8; 32];
        hex::decode_to_slice(&self.ephemeral_key, &mut key)
            .map_err(|e| ProtocolError::Malformed(format!("ephemeral_key: {}", e)))?;
        Ok(key)
    }

    pub fn next_node(&self) -> Option<NodeId> {
        self.destination.as_deref().and_then(|d| d.parse().ok())
    }
}

/// Final hop instructions for leaving the node network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRelay {
    pub host: String,
    pub target: String,
    pub method: String,
    pub protocol: String,
    pub port: u16,
}

/// `len(ciphertext) as u32 LE ‖ ciphertext ‖ json`
pub fn encode_ciphertext_plus_json<T: Serialize>(ciphertext: &[u8], json: &T) -> Result<Vec<u8>> {
    let len = u32::try_from(ciphertext.len())
        .map_err(|_| ProtocolError::Malformed("ciphertext exceeds u32 length".into()))?;
    let json = serde_json::to_vec(json)?;
    let mut out = Vec::with_capacity(4 + ciphertext.len() + json.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Split a framed payload back into ciphertext and JSON
pub fn decode_ciphertext_plus_json(data: &[u8]) -> Result<(Vec<u8>, Value)> {
    if data.len() < 4 {
        return Err(ProtocolError::Malformed("frame shorter than length prefix".into()));
    }
    let (len_bytes, rest) = data.split_at(4);
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    if rest.len() < len {
        return Err(ProtocolError::Malformed(format!(
            "frame declares {} ciphertext bytes, has {}",
            len,
            rest.len()
        )));
    }
    let (ciphertext, json) = rest.split_at(len);
    let value = if json.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(json)?
    };
    Ok((ciphertext.to_vec(), value))
}
