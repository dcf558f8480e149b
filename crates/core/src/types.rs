use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 32-byte public key
pub type PublicKey = [u8; 32];

/// Address placeholder advertised by nodes that are not reachable yet
pub const PLACEHOLDER_IP: &str = "0.0.0.0";

/// Routing identity of a service node (its ed25519 public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(PublicKey);

impl NodeId {
    pub fn from_bytes(bytes: PublicKey) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &PublicKey {
        &self.0
    }

    /// Shortened form for log lines: `0a1b2c...7e8f9a`
    pub fn short(&self) -> String {
        let full = hex::encode(self.0);
        format!("{}...{}", &full[..6], &full[full.len() - 6..])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Error returned when a node identity is not 64 hex characters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(pub String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node identity: {}", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| ParseNodeIdError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A service node as known to the routing layer
///
/// Equality and hashing only consider the routing identity: two records
/// with the same ed25519 key are the same node even if the address moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Public IPv4 address
    pub ip: String,
    /// Storage RPC port
    pub port: u16,
    /// Transport-encryption key used for onion layers
    #[serde(with = "hex::serde")]
    pub pubkey_x25519: PublicKey,
    /// Routing identity
    pub pubkey_ed25519: NodeId,
    /// Advertised software version
    #[serde(default)]
    pub version: String,
}

impl Node {
    pub fn id(&self) -> &NodeId {
        &self.pubkey_ed25519
    }

    /// `ip:port`, the key used when comparing network views
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.ip, self.port)
    }

    pub fn is_placeholder(&self) -> bool {
        self.ip == PLACEHOLDER_IP
    }

    /// First three octets of the address, if it is IPv4
    pub fn subnet24(&self) -> Option<[u8; 3]> {
        let ip: Ipv4Addr = self.ip.parse().ok()?;
        let o = ip.octets();
        Some([o[0], o[1], o[2]])
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey_ed25519 == other.pubkey_ed25519
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pubkey_ed25519.hash(state);
    }
}

/// Ordered chain of nodes a request travels through, guard first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionPath {
    nodes: Vec<Node>,
}

impl OnionPath {
    pub fn new(guard: Node, relays: Vec<Node>) -> Self {
        let mut nodes = Vec::with_capacity(relays.len() + 1);
        nodes.push(guard);
        nodes.extend(relays);
        Self { nodes }
    }

    pub fn guard(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Hops after the guard
    pub fn relays(&self) -> &[Node] {
        &self.nodes[1..]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id() == id)
    }

    /// True when no node appears twice
    pub fn is_distinct(&self) -> bool {
        let ids: HashSet<&NodeId> = self.nodes.iter().map(Node::id).collect();
        ids.len() == self.nodes.len()
    }

    /// Copy of this path with `bad` removed and `fresh` appended.
    ///
    /// Returns `None` when `bad` is the guard, is not on the path, or when
    /// `fresh` is already a member.
    pub fn repaired(&self, bad: &NodeId, fresh: Node) -> Option<OnionPath> {
        if self.guard().id() == bad || !self.contains(bad) || self.contains(fresh.id()) {
            return None;
        }
        let mut nodes: Vec<Node> = self.nodes.iter().filter(|n| n.id() != bad).cloned().collect();
        nodes.push(fresh);
        Some(Self { nodes })
    }
}

/// A bootstrap endpoint used when the node pool has to be rebuilt from scratch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    /// Primary URL, e.g. `https://seed1.example.net:4443`
    pub url: String,
    /// Alternate address for the same seed
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// PEM certificate the seed must present
    #[serde(default)]
    pub certificate_pem: Option<String>,
}

impl SeedNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fallback_url: None,
            certificate_pem: None,
        }
    }

    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        self.fallback_url = Some(url.into());
        self
    }

    /// Primary URL followed by the fallback, if any
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.fallback_url.as_deref())
    }
}

/// A message hash already handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenHash {
    pub hash: String,
    /// Unix milliseconds after which the entry may be pruned
    pub expires_at_ms: u64,
}

/// Newest message retrieved from one node for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastHash {
    pub hash: String,
    pub expires_at_ms: u64,
}

/// Current time in unix milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) fn test_node(n: u8) -> Node {
    let mut ed = [0u8; 32];
    ed[0] = n;
    ed[31] = 0xed;
    let mut x = [0u8; 32];
    x[0] = n;
    x[31] = 0x25;
    Node {
        ip: format!("10.0.{}.1", n),
        port: 22021,
        pubkey_x25519: x,
        pubkey_ed25519: NodeId::from_bytes(ed),
        version: "2.4.0".to_string(),
    }
}
