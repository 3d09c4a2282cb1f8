//! In-memory coordinator.
//!
//! Reproduces the scripted Redis semantics on process-local maps so node
//! logic and multi-node scenarios can be exercised without a store. The
//! whole state sits behind one mutex, which is exactly the atomicity the
//! Lua scripts give the real backend.

use crate::{Coordinator, CoordinatorError};
use async_trait::async_trait;
use murmur_model::{IndexCollection, NodeDescriptor, PeerBinding, RoomSnapshot, StrategyDef};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryCoordinator {
    inner: Mutex<Inner>,
    fail_next: AtomicBool,
}

#[derive(Default)]
struct Inner {
    discovery: HashSet<PeerBinding>,
    strategies: BTreeMap<String, StrategyDef>,
    collections: BTreeSet<IndexCollection>,
    tags: HashMap<IndexCollection, TagState>,
}

#[derive(Default)]
struct TagState {
    version: u64,
    rooms: BTreeMap<String, RoomState>,
}

#[derive(Default)]
struct RoomState {
    conns: HashSet<String>,
    by_node: HashMap<Uuid, HashSet<String>>,
    filter: Option<serde_json::Value>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with a transient error. Lets tests drive the
    /// failure paths (lock release, untouched replica).
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), CoordinatorError> {
        if self
            .fail_next
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(CoordinatorError::Transient("injected failure".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current version for a tag, without bumping it.
    pub fn version(&self, tag: &IndexCollection) -> u64 {
        self.lock().tags.get(tag).map(|t| t.version).unwrap_or(0)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn add_node(&self, node: &NodeDescriptor) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        self.lock().discovery.insert(node.binding());
        Ok(())
    }

    async fn remove_node(&self, binding: &PeerBinding) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        self.lock().discovery.remove(binding);
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<PeerBinding>, CoordinatorError> {
        self.check_failure()?;
        Ok(self.lock().discovery.iter().cloned().collect())
    }

    async fn sub_on(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
        filter: Option<&serde_json::Value>,
    ) -> Result<(u64, u64), CoordinatorError> {
        self.check_failure()?;
        let mut inner = self.lock();
        let state = inner.tags.entry(tag.clone()).or_default();
        state.version += 1;
        let room = state.rooms.entry(room_id.to_string()).or_default();
        room.conns.insert(connection_id.to_string());
        room.by_node
            .entry(node)
            .or_default()
            .insert(connection_id.to_string());
        if let Some(filter) = filter {
            room.filter = Some(filter.clone());
        }
        Ok((state.version, room.conns.len() as u64))
    }

    async fn sub_off(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
    ) -> Result<(u64, u64), CoordinatorError> {
        self.check_failure()?;
        let mut inner = self.lock();
        let state = inner.tags.entry(tag.clone()).or_default();
        state.version += 1;
        let version = state.version;

        let Some(room) = state.rooms.get_mut(room_id) else {
            return Ok((version, 0));
        };
        room.conns.remove(connection_id);
        if let Some(mine) = room.by_node.get_mut(&node) {
            mine.remove(connection_id);
            if mine.is_empty() {
                room.by_node.remove(&node);
            }
        }
        let total = room.conns.len() as u64;
        if total == 0 {
            state.rooms.remove(room_id);
        }
        Ok((version, total))
    }

    async fn clean_node(&self, tag: &IndexCollection, node: Uuid) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        let mut inner = self.lock();
        let Some(state) = inner.tags.get_mut(tag) else {
            return Ok(());
        };
        if !state.rooms.values().any(|room| room.by_node.contains_key(&node)) {
            // Nothing owned by this node: a repeat sweep leaves the store
            // untouched, version included.
            return Ok(());
        }
        state.version += 1;
        state.rooms.retain(|_, room| {
            if let Some(mine) = room.by_node.remove(&node) {
                for conn in mine {
                    room.conns.remove(&conn);
                }
            }
            !room.conns.is_empty()
        });
        Ok(())
    }

    async fn get_state(
        &self,
        tag: &IndexCollection,
    ) -> Result<(u64, Vec<RoomSnapshot>), CoordinatorError> {
        self.check_failure()?;
        let inner = self.lock();
        let Some(state) = inner.tags.get(tag) else {
            return Ok((0, Vec::new()));
        };
        let rooms = state
            .rooms
            .iter()
            .map(|(room_id, room)| RoomSnapshot {
                room_id: room_id.clone(),
                count: room.conns.len() as u64,
                filter: room.filter.clone(),
            })
            .collect();
        Ok((state.version, rooms))
    }

    async fn set_strategy(&self, name: &str, def: &StrategyDef) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        self.lock().strategies.insert(name.to_string(), def.clone());
        Ok(())
    }

    async fn delete_strategy(&self, name: &str) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        self.lock().strategies.remove(name);
        Ok(())
    }

    async fn strategies(&self) -> Result<HashMap<String, StrategyDef>, CoordinatorError> {
        self.check_failure()?;
        Ok(self
            .lock()
            .strategies
            .iter()
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect())
    }

    async fn register_collection(&self, tag: &IndexCollection) -> Result<(), CoordinatorError> {
        self.check_failure()?;
        self.lock().collections.insert(tag.clone());
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<IndexCollection>, CoordinatorError> {
        self.check_failure()?;
        Ok(self.lock().collections.iter().cloned().collect())
    }
}
