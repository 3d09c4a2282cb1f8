//! Coordinator store client.
//!
//! The coordinator is the fleet's single source of truth: per-tag room
//! membership with monotonic version counters, the discovery set, the
//! strategy hash and the collection registry. Every multi-key update goes
//! through an atomic script so a node never observes a count without its
//! matching version.

pub mod memory;
pub mod redis;

pub use memory::MemoryCoordinator;
pub use self::redis::RedisCoordinator;

use async_trait::async_trait;
use murmur_model::{IndexCollection, NodeDescriptor, PeerBinding, RoomSnapshot, StrategyDef};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub const DISCOVERY_KEY: &str = "cluster:discovery";
pub const STRATEGIES_KEY: &str = "cluster:strategies";
pub const COLLECTIONS_KEY: &str = "cluster:collections";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Timeout, reconnect in progress or a dropped connection. Setup paths
    /// retry these with bounded backoff; hot paths surface them.
    #[error("coordinator unavailable: {0}")]
    Transient(String),
    #[error("coordinator protocol error: {0}")]
    Protocol(String),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for CoordinatorError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_timeout() || e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
        {
            Self::Transient(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

/// Seam between the node and the external key-value coordinator.
///
/// The four scripted operations are atomic on the store side and keyed by
/// the `{index/collection}` hash tag; `sub_on`/`sub_off` return
/// `(version, total_count)` where the count is the fleet-wide sum.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    // ==================== Discovery ====================

    /// Advertise this node's bind points in the discovery set.
    async fn add_node(&self, node: &NodeDescriptor) -> Result<(), CoordinatorError>;

    /// Remove a node's bind points from the discovery set.
    async fn remove_node(&self, binding: &PeerBinding) -> Result<(), CoordinatorError>;

    /// Current discovery set.
    async fn discover(&self) -> Result<Vec<PeerBinding>, CoordinatorError>;

    // ==================== Scripted room state ====================

    /// Register one connection on a room.
    async fn sub_on(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
        filter: Option<&serde_json::Value>,
    ) -> Result<(u64, u64), CoordinatorError>;

    /// Drop one connection from a room. Node membership and the room itself
    /// are pruned when their last connection goes away.
    async fn sub_off(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
    ) -> Result<(u64, u64), CoordinatorError>;

    /// Remove every membership owned by `node` under the tag. Idempotent:
    /// a second sweep finds nothing and leaves the store untouched.
    async fn clean_node(&self, tag: &IndexCollection, node: Uuid) -> Result<(), CoordinatorError>;

    /// Authoritative snapshot for one tag.
    async fn get_state(
        &self,
        tag: &IndexCollection,
    ) -> Result<(u64, Vec<RoomSnapshot>), CoordinatorError>;

    // ==================== Strategy registry ====================

    async fn set_strategy(&self, name: &str, def: &StrategyDef) -> Result<(), CoordinatorError>;

    async fn delete_strategy(&self, name: &str) -> Result<(), CoordinatorError>;

    async fn strategies(&self) -> Result<HashMap<String, StrategyDef>, CoordinatorError>;

    // ==================== Collection registry ====================

    /// Record that a tag exists, so node cleanup knows which keyspaces to
    /// sweep.
    async fn register_collection(&self, tag: &IndexCollection) -> Result<(), CoordinatorError>;

    async fn collections(&self) -> Result<Vec<IndexCollection>, CoordinatorError>;
}
