//! Event bindings: the glue between the host's event bus and the cluster.
//!
//! Pipes intercept (and may delay) the triggering operation; hooks are
//! fire-and-forget. The host walks [`EVENT_BINDINGS`] once at startup and
//! wires each entry to the matching method here. Broadcast-only hooks that
//! fire before the node is ready are logged and dropped; the coordinator
//! stays authoritative and the next `state:all` repairs.

use crate::error::NodeError;
use crate::node::ClusterNode;
use murmur_model::{
    DocumentNotification, IndexCollection, StrategyDef, SyncEvent, Topic, UserNotification,
};
use murmur_net::Frame;
use serde::Serialize;
use serde_json::json;

/// How a handler participates in the host's event bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// Fire-and-forget.
    Hook,
    /// May delay or transform the triggering payload.
    Pipe,
}

/// Static registration table, built once and handed to the host.
pub const EVENT_BINDINGS: &[(&str, BindingKind)] = &[
    ("realtime:beforeJoin", BindingKind::Pipe),
    ("realtime:subscriptionAdded", BindingKind::Pipe),
    ("realtime:subscriptionJoined", BindingKind::Pipe),
    ("realtime:subscriptionOff", BindingKind::Pipe),
    ("auth:strategyAdded", BindingKind::Pipe),
    ("auth:strategyRemoved", BindingKind::Pipe),
    ("realtime:roomCreated", BindingKind::Hook),
    ("realtime:roomRemoved", BindingKind::Hook),
    ("realtime:errorSubscribe", BindingKind::Hook),
    ("realtime:errorUnsubscribe", BindingKind::Hook),
    ("security:profileChanged", BindingKind::Hook),
    ("security:roleChanged", BindingKind::Hook),
    ("security:validatorsChanged", BindingKind::Hook),
    ("storage:indexCacheAdded", BindingKind::Hook),
    ("storage:indexCacheRemoved", BindingKind::Hook),
    ("notify:document", BindingKind::Hook),
    ("notify:user", BindingKind::Hook),
    ("admin:dump", BindingKind::Hook),
    ("admin:resetSecurity", BindingKind::Hook),
    ("admin:shutdown", BindingKind::Hook),
    ("platform:started", BindingKind::Hook),
];

/// Diff emitted by the local realtime engine when a subscription creates
/// or populates a room.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct SubscriptionDiff {
    pub index: String,
    pub collection: String,
    pub room_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
}

/// Diff emitted when a customer joins a room by id.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct JoinDiff {
    pub index: String,
    pub collection: String,
    pub room_id: String,
    pub connection_id: String,
    /// False when the join attached without changing the room.
    pub changed: bool,
}

/// Diff emitted when a connection leaves a room.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct UnsubscribeDiff {
    pub index: String,
    pub collection: String,
    pub room_id: String,
    pub connection_id: String,
}

impl ClusterNode {
    // ==================== Pipes ====================

    /// `realtime:beforeJoin` — a join may race replication: the room can
    /// exist in the fleet before the local engine has it. Materialize a
    /// shell from the replica; failing that, wait once and re-check, then
    /// let the request proceed (and fail downstream if the room truly
    /// does not exist).
    pub async fn pipe_before_join(&self, room_id: &str) {
        for attempt in 0..2u8 {
            if self.platform.realtime.has_room(room_id) {
                return;
            }
            if let Some(room) = self.replica.get(room_id) {
                tracing::debug!(room = room_id, "materializing room shell for join");
                self.platform
                    .realtime
                    .materialize_room(room_id, &room.index, &room.collection);
                return;
            }
            if attempt == 0 {
                tokio::time::sleep(self.config.timers.join_attempt_interval()).await;
            }
        }
        tracing::warn!(room = room_id, "room still unknown after join wait");
    }

    /// `realtime:subscriptionAdded` — commit the new subscription to the
    /// coordinator and tell the fleet. The create lock spans the whole
    /// operation and is released on every exit path.
    pub async fn pipe_subscription_added(
        &self,
        diff: SubscriptionDiff,
    ) -> Result<SubscriptionDiff, NodeError> {
        let result = self
            .commit_sub_on(
                &diff.index,
                &diff.collection,
                &diff.room_id,
                &diff.connection_id,
                diff.filter.as_ref(),
                "add",
            )
            .await;
        self.locks.release_create(&diff.room_id);
        result.map(|_| diff)
    }

    /// `realtime:subscriptionJoined` — a join that did not change the room
    /// is a no-op; one that did commits like an add, with no filter.
    pub async fn pipe_subscription_joined(&self, diff: JoinDiff) -> Result<JoinDiff, NodeError> {
        if !diff.changed {
            return Ok(diff);
        }
        let result = self
            .commit_sub_on(
                &diff.index,
                &diff.collection,
                &diff.room_id,
                &diff.connection_id,
                None,
                "join",
            )
            .await;
        self.locks.release_create(&diff.room_id);
        result.map(|_| diff)
    }

    /// `realtime:subscriptionOff` — drop the connection fleet-wide. The
    /// delete lock is released on every exit path.
    pub async fn pipe_subscription_off(
        &self,
        diff: UnsubscribeDiff,
    ) -> Result<UnsubscribeDiff, NodeError> {
        let result = async {
            let tag = IndexCollection::new(&diff.index, &diff.collection);
            {
                // Store round-trip and replica update must not interleave
                // with another write on the same tag.
                let lock = self.tag_locks.for_tag(&tag);
                let _guard = lock.lock().await;
                let (version, count) = self
                    .coordinator
                    .sub_off(&tag, self.uuid, &diff.room_id, &diff.connection_id)
                    .await?;
                self.apply_room_update(&tag, &diff.room_id, version, count);
            }
            self.send_sync(&SyncEvent::State {
                index: diff.index.clone(),
                collection: diff.collection.clone(),
                post: "off".into(),
            })
            .await
        }
        .await;
        self.locks.release_delete(&diff.room_id);
        result.map(|_| diff)
    }

    /// `auth:strategyAdded` — record the strategy fleet-wide and let peers
    /// diff their registries.
    pub async fn pipe_strategy_added(
        &self,
        name: &str,
        def: &StrategyDef,
    ) -> Result<(), NodeError> {
        self.coordinator.set_strategy(name, def).await?;
        self.send_sync(&SyncEvent::Strategies).await
    }

    /// `auth:strategyRemoved`.
    pub async fn pipe_strategy_removed(&self, name: &str) -> Result<(), NodeError> {
        self.coordinator.delete_strategy(name).await?;
        self.send_sync(&SyncEvent::Strategies).await
    }

    async fn commit_sub_on(
        &self,
        index: &str,
        collection: &str,
        room_id: &str,
        connection_id: &str,
        filter: Option<&serde_json::Value>,
        post: &str,
    ) -> Result<(), NodeError> {
        let tag = IndexCollection::new(index, collection);
        {
            // Store round-trip and replica update must not interleave
            // with another write on the same tag: the version guard would
            // drop whichever result lands late.
            let lock = self.tag_locks.for_tag(&tag);
            let _guard = lock.lock().await;
            let (version, count) = self
                .coordinator
                .sub_on(&tag, self.uuid, room_id, connection_id, filter)
                .await?;
            self.apply_room_update(&tag, room_id, version, count);
        }
        self.coordinator.register_collection(&tag).await?;
        self.send_sync(&SyncEvent::State {
            index: index.to_string(),
            collection: collection.to_string(),
            post: post.to_string(),
        })
        .await
    }

    // ==================== Lock bracketing hooks ====================

    /// `realtime:roomCreated` — the engine is about to create this room.
    pub fn hook_room_created(&self, room_id: &str) {
        self.locks.lock_create(room_id);
    }

    /// `realtime:roomRemoved` — the engine is about to remove this room.
    pub fn hook_room_removed(&self, room_id: &str) {
        self.locks.lock_delete(room_id);
    }

    /// `realtime:errorSubscribe` — the pipe never ran, free its lock.
    pub fn hook_subscribe_failed(&self, room_id: &str) {
        self.locks.release_create(room_id);
    }

    /// `realtime:errorUnsubscribe`.
    pub fn hook_unsubscribe_failed(&self, room_id: &str) {
        self.locks.release_delete(room_id);
    }

    // ==================== Broadcast hooks ====================

    pub async fn hook_profile_changed(&self, id: &str) {
        self.hook_broadcast(
            Topic::Sync,
            &SyncEvent::Profile { id: id.to_string() },
        )
        .await;
    }

    pub async fn hook_role_changed(&self, id: &str) {
        self.hook_broadcast(Topic::Sync, &SyncEvent::Role { id: id.to_string() })
            .await;
    }

    pub async fn hook_validators_changed(&self) {
        self.hook_broadcast(Topic::Sync, &SyncEvent::Validators).await;
    }

    pub async fn hook_index_cache_added(&self, index: &str, collection: Option<&str>) {
        self.hook_broadcast(
            Topic::Sync,
            &SyncEvent::IndexCacheAdd {
                index: index.to_string(),
                collection: collection.map(str::to_string),
            },
        )
        .await;
    }

    pub async fn hook_index_cache_removed(&self, index: &str, collection: Option<&str>) {
        self.hook_broadcast(
            Topic::Sync,
            &SyncEvent::IndexCacheRemove {
                index: index.to_string(),
                collection: collection.map(str::to_string),
            },
        )
        .await;
    }

    pub async fn hook_notify_document(&self, notification: &DocumentNotification) {
        self.hook_broadcast(Topic::NotifyDocument, notification).await;
    }

    pub async fn hook_notify_user(&self, notification: &UserNotification) {
        self.hook_broadcast(Topic::NotifyUser, notification).await;
    }

    pub async fn hook_admin_reset_security(&self) {
        self.hook_broadcast(Topic::AdminResetSecurity, &json!({})).await;
    }

    pub async fn hook_admin_dump(&self, suffix: &str) {
        self.hook_broadcast(Topic::AdminDump, &json!({ "suffix": suffix }))
            .await;
    }

    pub async fn hook_admin_shutdown(&self) {
        self.hook_broadcast(Topic::AdminShutdown, &json!({})).await;
    }

    /// Broadcast-only hooks drop silently (at warn level) before the node
    /// is ready.
    async fn hook_broadcast(&self, topic: Topic, payload: &impl Serialize) {
        if !self.is_ready() {
            tracing::warn!(topic = %topic, "node not ready, dropping broadcast");
            return;
        }
        match Frame::encode(topic, payload) {
            Ok(frame) => {
                if let Err(e) = self.transport.publish(&frame).await {
                    tracing::warn!(topic = %topic, error = %e, "broadcast failed");
                }
            }
            Err(e) => tracing::error!(topic = %topic, error = %e, "broadcast encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_event_is_bound_exactly_once() {
        let mut seen = std::collections::HashSet::new();
        for (name, _) in EVENT_BINDINGS {
            assert!(seen.insert(*name), "duplicate binding for {name}");
        }
        assert_eq!(
            EVENT_BINDINGS
                .iter()
                .filter(|(_, kind)| *kind == BindingKind::Pipe)
                .count(),
            6
        );
    }
}
