//! Sync engine.
//!
//! Consumes `cluster:sync` payloads and reconciles local caches against
//! the coordinator. State pulls are version-guarded: a snapshot is applied
//! only when the coordinator's version is strictly newer than ours, and
//! rooms with an in-flight local decision are left alone. Engine failures
//! are logged, never raised to end users.

use crate::error::NodeError;
use crate::platform::Platform;
use crate::state::{PendingLocks, StateReplica, TagLocks};
use murmur_coordinator::Coordinator;
use murmur_model::{IndexCollection, SyncEvent};
use std::collections::HashSet;
use std::sync::Arc;

pub struct SyncEngine {
    coordinator: Arc<dyn Coordinator>,
    replica: Arc<StateReplica>,
    locks: Arc<PendingLocks>,
    tag_locks: Arc<TagLocks>,
    platform: Platform,
}

impl SyncEngine {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        replica: Arc<StateReplica>,
        locks: Arc<PendingLocks>,
        tag_locks: Arc<TagLocks>,
        platform: Platform,
    ) -> Self {
        Self {
            coordinator,
            replica,
            locks,
            tag_locks,
            platform,
        }
    }

    /// Entry point for `cluster:sync` frames. Unknown events are logged
    /// and dropped so newer nodes can fan out events we do not know yet.
    pub async fn handle(&self, payload: &serde_json::Value) {
        let event = match serde_json::from_value::<SyncEvent>(payload.clone()) {
            Ok(event) => event,
            Err(_) => {
                let name = payload
                    .get("event")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<missing>");
                tracing::warn!(event = name, "ignoring unknown sync event");
                return;
            }
        };
        if let Err(e) = self.dispatch(event).await {
            tracing::error!(error = %e, "sync event failed");
        }
    }

    async fn dispatch(&self, event: SyncEvent) -> Result<(), NodeError> {
        match event {
            SyncEvent::State {
                index, collection, ..
            } => self.pull_state(&IndexCollection::new(index, collection)).await,
            SyncEvent::StateAll { .. } => self.pull_all().await,
            SyncEvent::IndexCacheAdd { index, collection } => {
                self.platform
                    .index_cache
                    .add(&index, collection.as_deref(), false);
                Ok(())
            }
            SyncEvent::IndexCacheRemove { index, collection } => {
                self.platform
                    .index_cache
                    .remove(&index, collection.as_deref(), false);
                Ok(())
            }
            SyncEvent::Profile { id } => {
                self.platform.security.invalidate_profile(&id);
                Ok(())
            }
            SyncEvent::Role { id } => {
                self.platform.security.invalidate_role(&id);
                Ok(())
            }
            SyncEvent::Validators => {
                self.platform.security.reload_validators();
                Ok(())
            }
            SyncEvent::Strategies => self.sync_strategies().await,
        }
    }

    /// Version-guarded pull of one tag's authoritative state. The tag
    /// lock spans the fetch and the apply, so a pull cannot interleave
    /// with a local commit on the same tag.
    pub async fn pull_state(&self, tag: &IndexCollection) -> Result<(), NodeError> {
        let lock = self.tag_locks.for_tag(tag);
        let _guard = lock.lock().await;

        let (version, rooms) = self.coordinator.get_state(tag).await?;
        if version <= self.replica.get_version(tag) {
            tracing::debug!(tag = %tag, version, "snapshot not newer, skipping");
            return Ok(());
        }
        let skip = self.locks.snapshot();
        if self.replica.apply_snapshot(tag, version, &rooms, &skip) {
            tracing::debug!(tag = %tag, version, rooms = rooms.len(), "replica updated");
        }
        Ok(())
    }

    /// Pull every tag known to the coordinator.
    pub async fn pull_all(&self) -> Result<(), NodeError> {
        for tag in self.coordinator.collections().await? {
            self.pull_state(&tag).await?;
        }
        Ok(())
    }

    /// `pull_all` for repair paths: per-tag failures are logged and the
    /// round keeps going.
    pub async fn refresh_all(&self) {
        let tags = match self.coordinator.collections().await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enumerate collections for refresh");
                return;
            }
        };
        for tag in tags {
            if let Err(e) = self.pull_state(&tag).await {
                tracing::warn!(tag = %tag, error = %e, "refresh pull failed");
            }
        }
    }

    /// Diff the coordinator's strategy hash against the local registry:
    /// register what is new, unregister what is gone.
    async fn sync_strategies(&self) -> Result<(), NodeError> {
        let authoritative = self.coordinator.strategies().await?;
        let local: HashSet<String> = self.platform.strategies.registered().into_iter().collect();

        for (name, def) in &authoritative {
            if !local.contains(name) {
                tracing::info!(strategy = %name, "registering strategy from the fleet");
                self.platform.strategies.register(name, def);
            }
        }
        for name in local {
            if !authoritative.contains_key(&name) {
                tracing::info!(strategy = %name, "unregistering strategy removed from the fleet");
                self.platform.strategies.unregister(&name);
            }
        }
        Ok(())
    }
}
