//! SwarmRoute Network
//!
//! Everything that touches the wire:
//!
//! - storage RPC requests and responses ([`RpcRequest`], [`RetrievedMessage`], ...)
//! - the ciphertext-plus-JSON framing used inside onion layers
//! - seed bootstrap and node-list queries
//! - the [`NodeTransport`] seam and its reqwest implementation

mod bootstrap;
mod protocol;
mod transport;

pub use bootstrap::{
    default_seed_nodes, fetch_nodes_from_node, fetch_nodes_from_seed, has_seed_nodes,
    parse_seed_nodes, parse_seed_entry, DEFAULT_PORT, DEFAULT_SEED_NODES,
};
pub use protocol::{
    decode_ciphertext_plus_json, encode_ciphertext_plus_json, parse_destination_reply,
    parse_service_node_list, parse_swarm_nodes, DestinationReply, ExternalRelay, ProtocolError,
    RelayInstructions, RetrieveParams, RetrieveResult, RetrievedMessage, RpcRequest,
    ServiceNodeRecord, StoreParams, StoreResult, SwarmNodeRecord, METHOD_GET_N_SERVICE_NODES,
    METHOD_GET_SWARM, METHOD_INFO, METHOD_OXEND_REQUEST, METHOD_RETRIEVE, METHOD_STORE,
    NEXT_NODE_NOT_FOUND_PREFIX, ONION_ENDPOINT, RPC_ENDPOINT, SEED_ENDPOINT,
};
pub use transport::{HttpReply, HttpTransport, NodeTransport, TransportError};
