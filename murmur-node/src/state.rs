//! Local replica of the fleet's room state.
//!
//! A derived view, never the source of truth: the coordinator store is
//! authoritative and any divergence is repaired by the next `state` pull.
//! `flat` maps room ids to their record, `tree` groups room ids by
//! `index → collection`, and both always agree. Versions are per
//! `(index, collection)` and only ever move forward.

use murmur_model::{IndexCollection, Room, RoomSnapshot};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Default)]
pub struct StateReplica {
    inner: RwLock<ReplicaInner>,
}

#[derive(Default)]
struct ReplicaInner {
    flat: HashMap<String, Room>,
    tree: HashMap<String, HashMap<String, HashSet<String>>>,
    versions: HashMap<IndexCollection, u64>,
}

impl ReplicaInner {
    fn set(&mut self, index: &str, collection: &str, room_id: &str, count: u64) {
        // Room ids are fingerprints of (index, collection, filter); if one
        // ever shows up under another path, drop the stale entry first.
        let stale = self.flat.get(room_id).and_then(|existing| {
            (existing.index != index || existing.collection != collection)
                .then(|| (existing.index.clone(), existing.collection.clone()))
        });
        if let Some((old_index, old_collection)) = stale {
            self.unlink(&old_index, &old_collection, room_id);
        }
        self.flat.insert(
            room_id.to_string(),
            Room {
                room_id: room_id.to_string(),
                index: index.to_string(),
                collection: collection.to_string(),
                count,
            },
        );
        self.tree
            .entry(index.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    fn delete(&mut self, room_id: &str) {
        if let Some(room) = self.flat.remove(room_id) {
            self.unlink(&room.index, &room.collection, room_id);
        }
    }

    fn unlink(&mut self, index: &str, collection: &str, room_id: &str) {
        if let Some(collections) = self.tree.get_mut(index) {
            if let Some(rooms) = collections.get_mut(collection) {
                rooms.remove(room_id);
                if rooms.is_empty() {
                    collections.remove(collection);
                }
            }
            if collections.is_empty() {
                self.tree.remove(index);
            }
        }
    }
}

impl StateReplica {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ReplicaInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ReplicaInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a room's fleet-wide count. A zero count deletes the entry,
    /// a room with count zero is never stored.
    pub fn set_room_count(&self, index: &str, collection: &str, room_id: &str, count: u64) {
        if count == 0 {
            self.delete_room_count(room_id);
            return;
        }
        self.write().set(index, collection, room_id, count);
    }

    /// Remove a room from both maps, pruning empty inner maps.
    pub fn delete_room_count(&self, room_id: &str) {
        self.write().delete(room_id);
    }

    pub fn get(&self, room_id: &str) -> Option<Room> {
        self.read().flat.get(room_id).cloned()
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.read().flat.values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.read().flat.len()
    }

    /// Every `(index, collection)` currently present in the tree.
    pub fn tags(&self) -> Vec<IndexCollection> {
        let inner = self.read();
        inner
            .tree
            .iter()
            .flat_map(|(index, collections)| {
                collections
                    .keys()
                    .map(|collection| IndexCollection::new(index.clone(), collection.clone()))
            })
            .collect()
    }

    /// Last observed version for a tag, zero if unknown.
    pub fn get_version(&self, tag: &IndexCollection) -> u64 {
        self.read().versions.get(tag).copied().unwrap_or(0)
    }

    /// Monotonic set. Returns true when the version advanced; lower or
    /// equal values are ignored.
    pub fn set_version(&self, tag: &IndexCollection, version: u64) -> bool {
        let mut inner = self.write();
        let current = inner.versions.entry(tag.clone()).or_insert(0);
        if version > *current {
            *current = version;
            true
        } else {
            false
        }
    }

    /// Replace everything under one tag with an authoritative snapshot,
    /// leaving rooms in `skip` untouched (their local decision is still in
    /// flight). A snapshot older than what we hold is discarded. The write
    /// lock spans the whole exchange, so a snapshot never interleaves with
    /// another writer on the same tag.
    pub fn apply_snapshot(
        &self,
        tag: &IndexCollection,
        version: u64,
        rooms: &[RoomSnapshot],
        skip: &HashSet<String>,
    ) -> bool {
        let mut inner = self.write();
        if version <= inner.versions.get(tag).copied().unwrap_or(0) {
            return false;
        }
        let existing: Vec<String> = inner
            .tree
            .get(&tag.index)
            .and_then(|collections| collections.get(&tag.collection))
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        for room_id in existing {
            if !skip.contains(&room_id) {
                inner.delete(&room_id);
            }
        }
        for snapshot in rooms {
            if skip.contains(&snapshot.room_id) || snapshot.count == 0 {
                continue;
            }
            inner.set(&tag.index, &tag.collection, &snapshot.room_id, snapshot.count);
        }
        inner.versions.insert(tag.clone(), version);
        true
    }

    /// Wipe the replica: room maps and versions. The caller decides
    /// whether a `state:all` round should follow.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.flat.clear();
        inner.tree.clear();
        inner.versions.clear();
    }
}

/// Per-tag write serialization.
///
/// Every path that pairs a coordinator round-trip with a version-guarded
/// replica update (local subscribe/unsubscribe commits, `state` pulls)
/// holds the tag's lock from the coordinator call through the replica
/// write. Without it, two commits under one tag can return versions n and
/// n+1 from the store, then land out of order: the monotonic version
/// guard would silently drop the older room's count, and nothing on this
/// node would ever re-pull it.
#[derive(Default)]
pub struct TagLocks {
    inner: Mutex<HashMap<IndexCollection, Arc<tokio::sync::Mutex<()>>>>,
}

impl TagLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for one tag's lock. Callers lock it across the whole
    /// store-then-apply exchange.
    pub fn for_tag(&self, tag: &IndexCollection) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tag.clone())
            .or_default()
            .clone()
    }
}

/// Pending-operation locks.
///
/// `create` and `delete` hold room ids whose local subscribe/unsubscribe
/// decision has not been committed to the coordinator yet; sync-driven
/// mutations skip them. Entries bracket exactly one logical operation and
/// are released on success and failure alike.
#[derive(Default)]
pub struct PendingLocks {
    create: Mutex<HashSet<String>>,
    delete: Mutex<HashSet<String>>,
}

impl PendingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.create.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delete_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.delete.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_create(&self, room_id: &str) {
        self.create_set().insert(room_id.to_string());
    }

    pub fn release_create(&self, room_id: &str) {
        self.create_set().remove(room_id);
    }

    pub fn lock_delete(&self, room_id: &str) {
        self.delete_set().insert(room_id.to_string());
    }

    pub fn release_delete(&self, room_id: &str) {
        self.delete_set().remove(room_id);
    }

    pub fn is_empty(&self) -> bool {
        self.create_set().is_empty() && self.delete_set().is_empty()
    }

    /// Union of both sets, used to shield in-flight rooms from sync.
    pub fn snapshot(&self) -> HashSet<String> {
        let mut all: HashSet<String> = self.create_set().iter().cloned().collect();
        all.extend(self.delete_set().iter().cloned());
        all
    }
}
