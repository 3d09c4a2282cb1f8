//! Shared data model for the Murmur cluster.
//!
//! Everything that crosses a crate seam lives here: node identity and bind
//! points, room records, sync payloads, wire topics and configuration.

pub mod bindings;
pub mod config;
pub mod events;
pub mod types;

pub use config::{Bindings, ClusterConfig, RedisConfig, Timers};
pub use events::{SyncEvent, Topic};
pub use types::{
    DocumentNotification, Heartbeat, IndexCollection, NodeDescriptor, PeerBinding, Room,
    RoomSnapshot, StrategyDef, UserNotification,
};

pub use uuid::Uuid;
