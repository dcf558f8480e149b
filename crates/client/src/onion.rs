//! Onion encoding, delivery and response classification

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use swarmroute_core::{Fault, Node, NodeId, OnionError, OnionPath, PublicKey};
use swarmroute_crypto::{decrypt_symmetric, encrypt_for_pubkey, DestinationContext, SymmetricKey};
use swarmroute_network::{
    encode_ciphertext_plus_json, parse_destination_reply, parse_swarm_nodes, DestinationReply,
    ExternalRelay, HttpReply, NodeTransport, RelayInstructions, NEXT_NODE_NOT_FOUND_PREFIX,
    ONION_ENDPOINT,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where the innermost layer is addressed
#[derive(Debug, Clone)]
pub enum Destination {
    /// A service node, reached from the last path hop by identity
    Node(Node),
    /// A server outside the node network, reached by the last path hop
    /// over the given relay instructions
    External {
        relay: ExternalRelay,
        pubkey_x25519: PublicKey,
    },
}

impl Destination {
    pub fn pubkey_x25519(&self) -> &PublicKey {
        match self {
            Self::Node(node) => &node.pubkey_x25519,
            Self::External { pubkey_x25519, .. } => pubkey_x25519,
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Node(node) => Some(node.id()),
            Self::External { .. } => None,
        }
    }

    fn instructions(&self, ephemeral_key: &PublicKey) -> RelayInstructions {
        match self {
            Self::Node(node) => RelayInstructions::to_node(node.id(), ephemeral_key),
            Self::External { relay, .. } => RelayInstructions::to_external(relay, ephemeral_key),
        }
    }
}

/// Blob for the guard plus the key that opens the destination's reply
#[derive(Debug)]
pub struct EncodedOnion {
    pub guard_payload: Vec<u8>,
    pub destination_key: SymmetricKey,
}

fn framing_error(e: impl std::fmt::Display) -> OnionError {
    OnionError::Other(format!("onion framing: {}", e))
}

/// Wrap `payload` for `destination`, then once per hop from the last path
/// node back to the guard. Fresh ephemeral keys are drawn for every layer.
pub fn encode(
    path: &OnionPath,
    destination: &Destination,
    payload: &[u8],
    headers: &Value,
) -> Result<EncodedOnion, OnionError> {
    let plaintext = encode_ciphertext_plus_json(payload, headers).map_err(framing_error)?;
    let destination_ctx =
        encrypt_for_pubkey(destination.pubkey_x25519(), &plaintext).map_err(framing_error)?;

    let destination_key = destination_ctx.symmetric_key.clone();
    let mut instructions = destination.instructions(&destination_ctx.ephemeral_key);
    let mut inner: DestinationContext = destination_ctx;

    for hop in path.nodes().iter().rev() {
        let layer = encode_ciphertext_plus_json(&inner.ciphertext, &instructions).map_err(framing_error)?;
        inner = encrypt_for_pubkey(&hop.pubkey_x25519, &layer).map_err(framing_error)?;
        instructions = RelayInstructions::to_node(hop.id(), &inner.ephemeral_key);
    }

    let guard_payload = encode_ciphertext_plus_json(
        &inner.ciphertext,
        &RelayInstructions::for_guard(&inner.ephemeral_key),
    )
    .map_err(framing_error)?;

    Ok(EncodedOnion {
        guard_payload,
        destination_key,
    })
}

/// POST the blob to the guard. Cancellation wins over a pending reply;
/// transport failures count against the whole path.
pub async fn send(
    transport: &dyn NodeTransport,
    path: &OnionPath,
    payload: Vec<u8>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<HttpReply, OnionError> {
    let guard = path.guard();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OnionError::Aborted),
        result = transport.post_to_node(guard, ONION_ENDPOINT, payload, timeout) => {
            result.map_err(|e| {
                debug!("Onion send via {} failed: {}", guard.id().short(), e);
                OnionError::BadPath {
                    guard: *guard.id(),
                    fault: Fault::Path,
                    status: 0,
                }
            })
        }
    }
}

/// Classify the guard's answer and, when it carries one, open the
/// destination's reply.
pub fn decode(
    reply: &HttpReply,
    key: &SymmetricKey,
    path: &OnionPath,
    destination: &Destination,
) -> Result<DestinationReply, OnionError> {
    let guard = *path.guard().id();
    let text = reply.text();

    match reply.status {
        200 => {}
        406 | 425 => return Err(OnionError::ClockSkew(reply.status)),
        421 => {
            return Err(OnionError::WrongAssignment {
                replacement: replacement_swarm(&text),
            })
        }
        status => {
            if let Some(missing) = missing_node(&text) {
                return Err(bad_path(guard, Fault::NodeNotFound(missing), status));
            }
            if matches!(status, 400 | 404) {
                return Err(OnionError::Other(format!("path answered {}: {}", status, text)));
            }
            return Err(bad_path(guard, Fault::Path, status));
        }
    }

    let sealed = decode_body(&text)?;
    let plaintext = decrypt_symmetric(key, &sealed)
        .map_err(|e| OnionError::Other(format!("undecryptable reply: {}", e)))?;
    let answer = parse_destination_reply(&plaintext)
        .map_err(|e| OnionError::Other(format!("unparsable reply: {}", e)))?;

    match answer.status {
        // 400 means the request itself was bad; the node is fine
        200 | 400 => Ok(answer),
        406 | 425 => Err(OnionError::ClockSkew(answer.status)),
        421 => Err(OnionError::WrongAssignment {
            replacement: replacement_swarm(&answer.body),
        }),
        status => {
            if let Some(missing) = missing_node(&answer.body) {
                return Err(bad_path(guard, Fault::NodeNotFound(missing), status));
            }
            match destination.node_id() {
                Some(id) => Err(bad_path(guard, Fault::Node(*id), status)),
                None => Err(OnionError::Other(format!("destination answered {}", status))),
            }
        }
    }
}

fn bad_path(guard: NodeId, fault: Fault, status: u16) -> OnionError {
    OnionError::BadPath { guard, fault, status }
}

/// Body is base64, bare or as `{"result": "<base64>"}`
fn decode_body(text: &str) -> Result<Vec<u8>, OnionError> {
    let trimmed = text.trim();
    let encoded = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| OnionError::Other("reply object without result".into()))?,
        _ => trimmed.trim_matches('"').to_string(),
    };
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| OnionError::Other(format!("reply is not base64: {}", e)))
}

fn missing_node(text: &str) -> Option<NodeId> {
    text.trim()
        .strip_prefix(NEXT_NODE_NOT_FOUND_PREFIX)
        .and_then(|rest| rest.trim().parse().ok())
}

fn replacement_swarm(text: &str) -> Option<Vec<Node>> {
    let value: Value = serde_json::from_str(text).ok()?;
    parse_swarm_nodes(&value).ok().filter(|nodes| !nodes.is_empty())
}
