//! Cluster-aware replacements for the realtime controller actions.
//!
//! The host installs these over its own `realtime.count` and
//! `realtime.list` once at startup, and consults [`should_remove_room`]
//! before tearing a room out of its local engine.
//!
//! [`should_remove_room`]: RealtimeOverrides::should_remove_room

use crate::error::NodeError;
use crate::node::ClusterNode;
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct RealtimeOverrides {
    node: Arc<ClusterNode>,
}

impl RealtimeOverrides {
    pub fn new(node: Arc<ClusterNode>) -> Self {
        Self { node }
    }

    /// Fleet-wide subscriber count for one room.
    ///
    /// A missing room may simply not have replicated yet: wait once, then
    /// fail with not-found.
    pub async fn count(&self, room_id: Option<&str>) -> Result<u64, NodeError> {
        let room_id =
            room_id.ok_or_else(|| NodeError::InvalidInput("missing roomId".to_string()))?;
        if let Some(room) = self.node.replica().get(room_id) {
            return Ok(room.count);
        }
        tokio::time::sleep(self.node.config().timers.wait_for_missing_rooms()).await;
        self.node
            .replica()
            .get(room_id)
            .map(|room| room.count)
            .ok_or_else(|| NodeError::NotFound(format!("room {room_id} not found")))
    }

    /// Fleet-wide room listing, shaped `{index: {collection: {roomId:
    /// count}}}` and filtered to collections the caller may search. With
    /// `sorted`, keys come out lexicographically ordered at every level.
    pub async fn list(&self, caller: &str, sorted: bool) -> Result<Value, NodeError> {
        let mut permitted = Vec::new();
        for room in self.node.replica().rooms() {
            if self
                .node
                .platform()
                .permissions
                .can_search(caller, &room.index, &room.collection)
                .await
            {
                permitted.push(room);
            }
        }
        if sorted {
            permitted.sort_by(|a, b| {
                (&a.index, &a.collection, &a.room_id).cmp(&(&b.index, &b.collection, &b.room_id))
            });
        }

        let mut out = Map::new();
        for room in permitted {
            let collections = out
                .entry(room.index)
                .or_insert_with(|| Value::Object(Map::new()));
            let Some(collections) = collections.as_object_mut() else {
                continue;
            };
            let rooms = collections
                .entry(room.collection)
                .or_insert_with(|| Value::Object(Map::new()));
            let Some(rooms) = rooms.as_object_mut() else {
                continue;
            };
            rooms.insert(room.room_id, Value::from(room.count));
        }
        Ok(Value::Object(out))
    }

    /// Teardown guard for the local engine: a room may leave the local
    /// realtime structures only when the fleet count is ours alone. Other
    /// nodes still reference it otherwise.
    pub fn should_remove_room(&self, room_id: &str) -> bool {
        match self.node.replica().get(room_id) {
            Some(room) => room.count <= 1,
            None => true,
        }
    }
}
