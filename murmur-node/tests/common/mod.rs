//! Test harness: an in-process fleet over the channel transport and the
//! in-memory coordinator, with a recording platform mock.

// Not every test binary exercises every recorder.
#![allow(dead_code)]

use async_trait::async_trait;
use murmur_coordinator::{Coordinator, MemoryCoordinator};
use murmur_model::{
    ClusterConfig, DocumentNotification, StrategyDef, Timers, UserNotification,
};
use murmur_net::{ChannelHub, ChannelTransport};
use murmur_node::{
    AdminHost, ClusterNode, IndexCacheHost, PermissionsHost, Platform, RealtimeHost,
    RealtimeOverrides, SecurityHost, StrategyHost,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every call the cluster makes into the host.
#[derive(Default)]
pub struct MockPlatform {
    pub rooms: Mutex<HashMap<String, (String, String)>>,
    pub documents: Mutex<Vec<DocumentNotification>>,
    pub users: Mutex<Vec<UserNotification>>,
    pub index_cache_ops: Mutex<Vec<(String, String, Option<String>, bool)>>,
    pub invalidated_profiles: Mutex<Vec<String>>,
    pub invalidated_roles: Mutex<Vec<String>>,
    pub validator_reloads: AtomicUsize,
    pub strategies: Mutex<HashMap<String, StrategyDef>>,
    pub denied: Mutex<HashSet<(String, String)>>,
    pub dumps: Mutex<Vec<String>>,
    pub security_resets: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockPlatform {
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            realtime: self.clone(),
            index_cache: self.clone(),
            security: self.clone(),
            strategies: self.clone(),
            permissions: self.clone(),
            admin: self.clone(),
        }
    }

    pub fn deny_search(&self, index: &str, collection: &str) {
        self.denied
            .lock()
            .unwrap()
            .insert((index.to_string(), collection.to_string()));
    }

    pub fn strategy_names(&self) -> HashSet<String> {
        self.strategies.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_room_named(&self, room_id: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(room_id)
    }
}

impl RealtimeHost for MockPlatform {
    fn has_room(&self, room_id: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(room_id)
    }

    fn materialize_room(&self, room_id: &str, index: &str, collection: &str) {
        self.rooms.lock().unwrap().insert(
            room_id.to_string(),
            (index.to_string(), collection.to_string()),
        );
    }

    fn dispatch_document(&self, notification: &DocumentNotification) {
        self.documents.lock().unwrap().push(notification.clone());
    }

    fn dispatch_user(&self, notification: &UserNotification) {
        self.users.lock().unwrap().push(notification.clone());
    }
}

impl IndexCacheHost for MockPlatform {
    fn add(&self, index: &str, collection: Option<&str>, propagate: bool) {
        self.index_cache_ops.lock().unwrap().push((
            "add".to_string(),
            index.to_string(),
            collection.map(str::to_string),
            propagate,
        ));
    }

    fn remove(&self, index: &str, collection: Option<&str>, propagate: bool) {
        self.index_cache_ops.lock().unwrap().push((
            "remove".to_string(),
            index.to_string(),
            collection.map(str::to_string),
            propagate,
        ));
    }
}

impl SecurityHost for MockPlatform {
    fn invalidate_profile(&self, id: &str) {
        self.invalidated_profiles.lock().unwrap().push(id.to_string());
    }

    fn invalidate_role(&self, id: &str) {
        self.invalidated_roles.lock().unwrap().push(id.to_string());
    }

    fn reload_validators(&self) {
        self.validator_reloads.fetch_add(1, Ordering::SeqCst);
    }
}

impl StrategyHost for MockPlatform {
    fn registered(&self) -> Vec<String> {
        self.strategies.lock().unwrap().keys().cloned().collect()
    }

    fn register(&self, name: &str, def: &StrategyDef) {
        self.strategies
            .lock()
            .unwrap()
            .insert(name.to_string(), def.clone());
    }

    fn unregister(&self, name: &str) {
        self.strategies.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl PermissionsHost for MockPlatform {
    async fn can_search(&self, _caller: &str, index: &str, collection: &str) -> bool {
        !self
            .denied
            .lock()
            .unwrap()
            .contains(&(index.to_string(), collection.to_string()))
    }
}

impl AdminHost for MockPlatform {
    fn reset_security(&self) {
        self.security_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn dump(&self, suffix: &str) {
        self.dumps.lock().unwrap().push(suffix.to_string());
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestNode {
    pub node: Arc<ClusterNode>,
    pub platform: Arc<MockPlatform>,
    pub overrides: RealtimeOverrides,
}

pub fn fast_timers() -> Timers {
    Timers {
        join_attempt_interval_ms: 50,
        wait_for_missing_rooms_ms: 200,
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 250,
    }
}

pub async fn spawn_node(
    hub: &ChannelHub,
    coordinator: &Arc<MemoryCoordinator>,
    name: &str,
    timers: Timers,
) -> TestNode {
    let config = ClusterConfig {
        bindings: murmur_model::Bindings {
            pub_addr: format!("{name}-pub"),
            router: format!("{name}-router"),
        },
        timers,
        ..ClusterConfig::default()
    };
    let platform = Arc::new(MockPlatform::default());
    let node = ClusterNode::new(
        config,
        coordinator.clone() as Arc<dyn Coordinator>,
        Arc::new(ChannelTransport::new(hub.clone())),
        platform.platform(),
    );
    node.start().await.expect("node failed to start");
    TestNode {
        overrides: RealtimeOverrides::new(node.clone()),
        node,
        platform,
    }
}

/// Poll a condition until it holds, or fail the test.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
