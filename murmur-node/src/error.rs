//! Error taxonomy for node operations.
//!
//! Transient coordinator and peer failures carry their own variants so
//! callers can tell a retryable condition from a caller mistake. Sync
//! engine failures never reach end users, they are logged at the engine.

use murmur_coordinator::CoordinatorError;
use murmur_net::TransportError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The operation needs a ready node and this one is still starting.
    #[error("cluster node is not ready")]
    NotReady,

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
