//! Requests to service nodes over onion paths
//!
//! Every outcome of a round-trip is fed to the failure tracker before it is
//! returned, so retry loops always run against an updated view of the
//! network.

use rand::seq::SliceRandom;
use serde_json::json;
use swarmroute_core::{now_ms, Fault, Node, OnionError, OnionPath, Result, RouteError};
use swarmroute_crypto::sign_request;
use swarmroute_network::{
    parse_swarm_nodes, DestinationReply, RetrieveParams, RetrieveResult, RpcRequest, StoreParams,
    StoreResult, METHOD_RETRIEVE,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::RoutingContext;
use crate::onion::{self, Destination};

impl RoutingContext {
    /// One onion round-trip over `path`, with attribution.
    ///
    /// `swarm` names the identity whose swarm the destination serves, so
    /// destination failures and reassignments reach the right member list.
    pub async fn send_via_path(
        &self,
        path: &OnionPath,
        destination: &Destination,
        payload: &[u8],
        swarm: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DestinationReply> {
        let encoded = onion::encode(path, destination, payload, &json!({}))?;
        let sent = onion::send(
            self.transport(),
            path,
            encoded.guard_payload,
            self.config().onion_request_timeout,
            cancel,
        )
        .await;

        let outcome = match sent {
            Ok(_) if cancel.is_cancelled() => Err(OnionError::Aborted),
            Ok(reply) => onion::decode(&reply, &encoded.destination_key, path, destination),
            Err(e) => Err(e),
        };

        if let Err(e) = self.attribute(path, destination, swarm, &outcome) {
            warn!("Failed to record onion outcome: {}", e);
        }
        match outcome {
            Ok(reply) if !reply.is_success() => Err(RouteError::Rejected {
                status: reply.status,
                body: reply.body,
            }),
            other => other.map_err(RouteError::from),
        }
    }

    fn attribute(
        &self,
        path: &OnionPath,
        destination: &Destination,
        swarm: Option<&str>,
        outcome: &std::result::Result<DestinationReply, OnionError>,
    ) -> Result<()> {
        let failures = self.failures();
        let guard = path.guard().id();
        let destination_id = destination.node_id();
        // swarm membership only applies to the destination itself
        let swarm_of = |id: &swarmroute_core::NodeId| swarm.filter(|_| destination_id == Some(id));

        match outcome {
            Ok(_) => {
                failures.on_path_success(guard);
                for node in path.nodes() {
                    failures.on_node_success(node.id());
                }
                if let Some(id) = destination_id {
                    failures.on_node_success(id);
                }
            }
            Err(OnionError::BadPath { fault: Fault::Path, .. }) => {
                failures.on_path_failure(guard)?;
            }
            Err(OnionError::BadPath { fault: Fault::Node(id), .. }) => {
                failures.on_node_failure(id, swarm_of(id))?;
            }
            Err(OnionError::BadPath { fault: Fault::NodeNotFound(id), .. }) => {
                failures.evict_node(id, swarm_of(id))?;
            }
            Err(OnionError::WrongAssignment { replacement }) => {
                if let (Some(identity), Some(responder)) = (swarm, destination_id) {
                    failures.on_redirect(identity, replacement.as_deref(), responder)?;
                }
            }
            Err(OnionError::ClockSkew(status)) => {
                warn!("Destination rejected our clock (status {})", status);
            }
            Err(OnionError::Other(reason)) => debug!("Unattributed onion failure: {}", reason),
            Err(OnionError::Aborted) => {}
        }
        Ok(())
    }

    /// Single attempt: one path, one round-trip
    pub async fn send_to_node(
        &self,
        target: &Node,
        request: &RpcRequest,
        swarm: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DestinationReply> {
        let payload = encode_request(request)?;
        let path = self.get_path(Some(target.id())).await?;
        self.send_via_path(&path, &Destination::Node(target.clone()), &payload, swarm, cancel)
            .await
    }

    /// Send `request` to `target`, retrying retryable failures on other
    /// paths up to `onion_fetch_attempts` times.
    pub async fn onion_fetch(
        &self,
        target: &Node,
        request: &RpcRequest,
        swarm: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DestinationReply> {
        let payload = encode_request(request)?;
        let destination = Destination::Node(target.clone());
        let attempts = self.config().onion_fetch_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(OnionError::Aborted.into());
            }
            if attempt > 1 && !self.pool().contains(target.id()) {
                debug!("Target {} left the pool, giving up", target.id().short());
                break;
            }

            let path = self.get_path(Some(target.id())).await?;
            match self
                .send_via_path(&path, &destination, &payload, swarm, cancel)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(RouteError::Onion(OnionError::BadPath {
                    fault: Fault::NodeNotFound(id),
                    ..
                })) if id == *target.id() => {
                    return Err(RouteError::NoPathAvailable(format!(
                        "target {} is unknown to the network",
                        id.short()
                    )));
                }
                Err(e) if e.is_retryable() => {
                    debug!(
                        "{} to {} failed (attempt {}/{}): {}",
                        request.method,
                        target.id().short(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RouteError::NoPathAvailable(format!("{} to {} abandoned", request.method, target.id().short()))
        }))
    }

    /// Ask a random node which nodes serve `identity`
    pub async fn fetch_swarm_from_network(
        &self,
        identity: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Node>> {
        if cancel.is_cancelled() {
            return Err(OnionError::Aborted.into());
        }
        let target = self.pool().get_random(&Default::default()).await?;
        let reply = self
            .onion_fetch(&target, &RpcRequest::get_swarm(identity), None, cancel)
            .await?;
        let value = reply
            .json()
            .map_err(|e| RouteError::InvalidResponse(e.to_string()))?;
        let members = parse_swarm_nodes(&value).map_err(|e| RouteError::InvalidResponse(e.to_string()))?;
        if members.is_empty() {
            return Err(RouteError::InvalidResponse(format!("empty swarm for {}", identity)));
        }
        Ok(members)
    }

    /// Swarm members for `identity`, fetched from the network when the
    /// recorded list is too small
    pub async fn get_swarm(&self, identity: &str, cancel: &CancellationToken) -> Result<Vec<Node>> {
        self.swarms()
            .get_swarm(identity, move |_| self.fetch_swarm_from_network(identity, cancel))
            .await
    }

    /// Store a base64 message in `identity`'s swarm
    pub async fn store_message(
        &self,
        identity: &str,
        data: String,
        ttl_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<StoreResult> {
        let swarm = self.get_swarm(identity, cancel).await?;
        let target = swarm
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(RouteError::InsufficientNodes { have: 0, need: 1 })?;

        let params = StoreParams {
            pubkey: identity.to_string(),
            data,
            ttl: ttl_ms,
            timestamp: now_ms(),
        };
        let reply = self
            .send_to_node(&target, &RpcRequest::store(&params), Some(identity), cancel)
            .await?;
        parse_body(&reply)
    }

    /// Messages for `identity` on `node` newer than `last_hash`
    pub async fn retrieve_messages(
        &self,
        identity: &str,
        node: &Node,
        last_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RetrieveResult> {
        let mut params = RetrieveParams::new(identity, last_hash);
        if let Some(signer) = self.signer(identity) {
            let timestamp = now_ms();
            params.timestamp = Some(timestamp);
            params.pubkey_ed25519 = Some(hex::encode(signer.public_key_bytes()));
            params.signature = Some(sign_request(&signer, METHOD_RETRIEVE, timestamp));
        }

        let reply = self
            .send_to_node(node, &RpcRequest::retrieve(&params), Some(identity), cancel)
            .await?;
        parse_body(&reply)
    }
}

fn encode_request(request: &RpcRequest) -> Result<Vec<u8>> {
    request
        .to_bytes()
        .map_err(|e| RouteError::InvalidResponse(format!("encode {}: {}", request.method, e)))
}

fn parse_body<T: serde::de::DeserializeOwned>(reply: &DestinationReply) -> Result<T> {
    serde_json::from_str(&reply.body).map_err(|e| RouteError::InvalidResponse(e.to_string()))
}
