//! Murmur cluster node.
//!
//! The per-node half of the clustering subsystem: discovers peers through
//! the coordinator store, keeps a replicated view of realtime room state,
//! fans sync events over the node-to-node fabric and intercepts local
//! realtime operations to give cluster-wide answers. Eventually
//! consistent by design: there is no consensus and no leader, the
//! coordinator's per-tag version counters are the only ordering
//! authority.

pub mod bindings;
pub mod error;
pub mod node;
pub mod overrides;
pub mod platform;
pub mod shutdown;
pub mod state;
pub mod sync;

pub use bindings::{BindingKind, JoinDiff, SubscriptionDiff, UnsubscribeDiff, EVENT_BINDINGS};
pub use error::NodeError;
pub use node::{ClusterNode, PeerState};
pub use overrides::RealtimeOverrides;
pub use platform::{
    AdminHost, IndexCacheHost, PermissionsHost, Platform, RealtimeHost, SecurityHost, StrategyHost,
};
pub use shutdown::ShutdownGuard;
pub use state::{PendingLocks, StateReplica, TagLocks};
pub use sync::SyncEngine;
