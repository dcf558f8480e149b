use thiserror::Error;

use crate::types::{Node, NodeId};

/// Which part of a path an onion failure is blamed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The culprit is unknown; the whole path is suspect
    Path,
    /// The named node answered with an unexplained error
    Node(NodeId),
    /// A hop reported that the named node does not exist
    NodeNotFound(NodeId),
}

/// Outcome categories of one onion round-trip
#[derive(Error, Debug, Clone)]
pub enum OnionError {
    /// A hop could not reach the next one or failed without explanation
    #[error("bad path via guard {guard:?} (status {status}, fault {fault:?})")]
    BadPath {
        guard: NodeId,
        fault: Fault,
        status: u16,
    },

    /// Destination rejected the request timestamp
    #[error("clock out of sync with the network (status {0})")]
    ClockSkew(u16),

    /// Destination no longer serves the requested swarm
    #[error("wrong swarm assignment ({} replacement nodes)", .replacement.as_ref().map_or(0, Vec::len))]
    WrongAssignment { replacement: Option<Vec<Node>> },

    /// Garbled, undecodable, or unclassified response
    #[error("onion request failed: {0}")]
    Other(String),

    /// Caller cancelled the request
    #[error("onion request aborted")]
    Aborted,
}

impl OnionError {
    /// BadPath and Other may succeed on another path
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BadPath { .. } | Self::Other(_))
    }
}

/// Errors from routing operations
#[derive(Error, Debug, Clone)]
pub enum RouteError {
    #[error(transparent)]
    Onion(#[from] OnionError),

    #[error("not enough nodes: have {have}, need {need}")]
    InsufficientNodes { have: usize, need: usize },

    #[error("consensus refresh failed: {agreed} nodes in common, need {required}")]
    ConsensusFailed { agreed: usize, required: usize },

    #[error("seed bootstrap failed: {0}")]
    SeedUnavailable(String),

    #[error("no onion path available: {0}")]
    NoPathAvailable(String),

    #[error("guard selection failed: found {found} of {needed} healthy guards")]
    GuardSelectionFailed { found: usize, needed: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The destination answered but refused the request as malformed
    #[error("destination rejected the request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RouteError {
    /// Whether a bounded retry loop should try again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Onion(e) => e.is_retryable(),
            Self::Storage(_) | Self::Config(_) | Self::Rejected { .. } => false,
            _ => true,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Onion(OnionError::Aborted))
    }
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// Errors from the persistence collaborator
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state format: {0}")]
    InvalidFormat(String),
}

impl From<StoreError> for RouteError {
    fn from(e: StoreError) -> Self {
        RouteError::Storage(e.to_string())
    }
}
