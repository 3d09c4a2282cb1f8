//! Core cluster types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity and bind points of one cluster node.
///
/// Created at process start, inserted into discovery once the transport is
/// bound, removed on shutdown or when a peer sweeps a dead node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub uuid: Uuid,
    #[serde(rename = "pub")]
    pub pub_addr: String,
    #[serde(rename = "router")]
    pub router_addr: String,
    /// Unix millis at process start.
    pub birthdate: i64,
}

impl NodeDescriptor {
    pub fn binding(&self) -> PeerBinding {
        PeerBinding {
            pub_addr: self.pub_addr.clone(),
            router_addr: self.router_addr.clone(),
        }
    }
}

/// The pair of endpoints a peer advertises in the discovery set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerBinding {
    #[serde(rename = "pub")]
    pub pub_addr: String,
    #[serde(rename = "router")]
    pub router_addr: String,
}

/// An `(index, collection)` pair.
///
/// Renders the `{index/collection}` hash tag that keeps every coordinator
/// key for one collection on one shard, so the atomic scripts can touch
/// them all in a single call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexCollection {
    pub index: String,
    pub collection: String,
}

impl IndexCollection {
    pub fn new(index: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            collection: collection.into(),
        }
    }

    /// The co-location tag, e.g. `{idx/col}`.
    pub fn tag(&self) -> String {
        format!("{{{}/{}}}", self.index, self.collection)
    }

    /// The bare `index/collection` token stored in the collection registry.
    pub fn token(&self) -> String {
        format!("{}/{}", self.index, self.collection)
    }

    /// Parse an `index/collection` token. The index may not contain `/`.
    pub fn parse_token(token: &str) -> Option<Self> {
        let (index, collection) = token.split_once('/')?;
        if index.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(index, collection))
    }
}

impl fmt::Display for IndexCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.collection)
    }
}

/// One realtime subscription identity with its fleet-wide subscriber count.
///
/// `room_id` is a fingerprint of `(index, collection, filter)` assigned by
/// the realtime engine; the cluster treats it as opaque. A room with count
/// zero is never stored, it is deleted instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub index: String,
    pub collection: String,
    pub count: u64,
}

/// Authoritative per-room record returned by the `getState` script.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

/// Periodic liveness payload on `cluster:heartbeat`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uuid: Uuid,
    pub birthdate: i64,
    #[serde(rename = "pub")]
    pub pub_addr: String,
    #[serde(rename = "router")]
    pub router_addr: String,
}

impl Heartbeat {
    pub fn binding(&self) -> PeerBinding {
        PeerBinding {
            pub_addr: self.pub_addr.clone(),
            router_addr: self.router_addr.clone(),
        }
    }
}

/// Value type of the `cluster:strategies` hash: which plugin owns the
/// authentication strategy, plus its serialized definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyDef {
    pub plugin: String,
    pub strategy: serde_json::Value,
}

/// A document-scope notification fanned out to peers whose subscribers care.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentNotification {
    /// Rooms the notification targets.
    pub rooms: Vec<String>,
    /// Serialized notification body, delivered verbatim.
    pub payload: serde_json::Value,
}

/// A user-scope notification (subscriber joined or left) for one room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub room_id: String,
    pub payload: serde_json::Value,
}
