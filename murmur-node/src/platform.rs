//! Seam to the host platform.
//!
//! The cluster never rewrites host methods at runtime; the host injects
//! these collaborators at construction and installs the replacements from
//! [`crate::overrides`] over its own realtime controller.

use async_trait::async_trait;
use murmur_model::{DocumentNotification, StrategyDef, UserNotification};
use std::sync::Arc;

/// The host's realtime engine (room registry and notification dispatch).
pub trait RealtimeHost: Send + Sync {
    /// Whether the local engine currently holds this room.
    fn has_room(&self, room_id: &str) -> bool;

    /// Create an empty room shell so a joining customer can attach even
    /// though no local client subscribed yet.
    fn materialize_room(&self, room_id: &str, index: &str, collection: &str);

    /// Deliver a document notification to local subscribers.
    fn dispatch_document(&self, notification: &DocumentNotification);

    /// Deliver a user notification to local subscribers.
    fn dispatch_user(&self, notification: &UserNotification);
}

/// The storage engine's index/collection cache.
pub trait IndexCacheHost: Send + Sync {
    /// `propagate` is false when the change came from a peer, so the cache
    /// must not re-emit the event it was fed.
    fn add(&self, index: &str, collection: Option<&str>, propagate: bool);
    fn remove(&self, index: &str, collection: Option<&str>, propagate: bool);
}

/// Security caches: profiles, roles and validation specifications.
pub trait SecurityHost: Send + Sync {
    fn invalidate_profile(&self, id: &str);
    fn invalidate_role(&self, id: &str);
    fn reload_validators(&self);
}

/// The host's authentication strategy registry.
pub trait StrategyHost: Send + Sync {
    /// Names of every locally registered strategy.
    fn registered(&self) -> Vec<String>;
    fn register(&self, name: &str, def: &StrategyDef);
    fn unregister(&self, name: &str);
}

/// Permission checks for the list override.
#[async_trait]
pub trait PermissionsHost: Send + Sync {
    /// Whether the caller may run `document:search` on the collection.
    async fn can_search(&self, caller: &str, index: &str, collection: &str) -> bool;
}

/// Fleet-wide administrative actions, applied locally.
pub trait AdminHost: Send + Sync {
    fn reset_security(&self);
    fn dump(&self, suffix: &str);
    /// The host's own orderly exit, invoked after cluster cleanup.
    fn shutdown(&self);
}

/// Everything the cluster needs from the host, injected once at
/// construction.
#[derive(Clone)]
pub struct Platform {
    pub realtime: Arc<dyn RealtimeHost>,
    pub index_cache: Arc<dyn IndexCacheHost>,
    pub security: Arc<dyn SecurityHost>,
    pub strategies: Arc<dyn StrategyHost>,
    pub permissions: Arc<dyn PermissionsHost>,
    pub admin: Arc<dyn AdminHost>,
}
