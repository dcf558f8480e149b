//! HTTP transport to storage and seed nodes

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use swarmroute_core::{Node, SeedNode};
use thiserror::Error;
use tracing::debug;

/// Raw HTTP answer from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid certificate: {0}")]
    Certificate(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Delivery of request bodies to nodes.
///
/// Implementations only move bytes; classification of the answer is left
/// to the caller.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// POST `body` to `endpoint` on `node`
    async fn post_to_node(
        &self,
        node: &Node,
        endpoint: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpReply>;

    /// POST `body` to `url`, trusting only the seed's pinned certificate
    async fn post_to_seed(
        &self,
        seed: &SeedNode,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpReply>;
}

/// [`NodeTransport`] over reqwest
pub struct HttpTransport {
    scheme: &'static str,
    node_client: reqwest::Client,
    default_seed_client: reqwest::Client,
    /// Clients pinned to a seed certificate, keyed by PEM
    pinned_clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl HttpTransport {
    /// HTTPS transport; storage nodes present self-signed certificates
    pub fn new() -> Result<Self> {
        Self::with_scheme("https")
    }

    /// Plain HTTP, for local test networks
    pub fn plain_http() -> Result<Self> {
        Self::with_scheme("http")
    }

    fn with_scheme(scheme: &'static str) -> Result<Self> {
        let node_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let default_seed_client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            scheme,
            node_client,
            default_seed_client,
            pinned_clients: Mutex::new(HashMap::new()),
        })
    }

    fn node_url(&self, node: &Node, endpoint: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, node.ip, node.port, endpoint)
    }

    fn seed_client(&self, seed: &SeedNode) -> Result<reqwest::Client> {
        let Some(pem) = seed.certificate_pem.as_ref() else {
            return Ok(self.default_seed_client.clone());
        };

        let mut clients = self.pinned_clients.lock();
        if let Some(client) = clients.get(pem) {
            return Ok(client.clone());
        }

        let cert = reqwest::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        let client = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        clients.insert(pem.clone(), client.clone());
        Ok(client)
    }

    async fn post(client: &reqwest::Client, url: &str, body: Vec<u8>, timeout: Duration) -> Result<HttpReply> {
        debug!("POST {} ({} bytes)", url, body.len());
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(HttpReply::new(status, body.to_vec()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Http(e.to_string())
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn post_to_node(
        &self,
        node: &Node,
        endpoint: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let url = self.node_url(node, endpoint);
        Self::post(&self.node_client, &url, body, timeout).await
    }

    async fn post_to_seed(
        &self,
        seed: &SeedNode,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let client = self.seed_client(seed)?;
        Self::post(&client, url, body, timeout).await
    }
}
