//! End-to-end fleet scenarios over the in-memory fabric and coordinator.

mod common;

use common::{fast_timers, spawn_node, wait_until, TestNode};
use murmur_coordinator::{Coordinator, MemoryCoordinator};
use murmur_model::{IndexCollection, StrategyDef};
use murmur_net::ChannelHub;
use murmur_node::bindings::{JoinDiff, SubscriptionDiff, UnsubscribeDiff};
use serde_json::json;
use std::sync::Arc;

fn tag() -> IndexCollection {
    IndexCollection::new("idx", "col")
}

fn sub_diff(room: &str, conn: &str) -> SubscriptionDiff {
    SubscriptionDiff {
        index: "idx".into(),
        collection: "col".into(),
        room_id: room.into(),
        connection_id: conn.into(),
        filter: Some(json!({"exists": "field"})),
    }
}

async fn two_nodes() -> (ChannelHub, Arc<MemoryCoordinator>, TestNode, TestNode) {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;
    let b = spawn_node(&hub, &coordinator, "b", fast_timers()).await;

    // b announced itself over a's router; a's pool fills immediately,
    // b learns a's identity from its first heartbeat.
    let (a_node, b_node) = (a.node.clone(), b.node.clone());
    wait_until("nodes to see each other", move || {
        a_node.pool_size() == 1 && b_node.pool_size() == 1
    })
    .await;
    (hub, coordinator, a, b)
}

#[tokio::test]
async fn subscribe_fans_out_to_the_fleet() {
    let (_hub, coordinator, a, b) = two_nodes().await;

    a.node.hook_room_created("R");
    let diff = a
        .node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    assert_eq!(diff.room_id, "R");

    assert_eq!(coordinator.version(&tag()), 1);
    let (version, rooms) = coordinator.get_state(&tag()).await.unwrap();
    assert_eq!((version, rooms.len()), (1, 1));
    assert_eq!(rooms[0].count, 1);

    let room = a.node.replica().get("R").unwrap();
    assert_eq!((room.index.as_str(), room.collection.as_str(), room.count), ("idx", "col", 1));

    let b_replica = b.node.replica().clone();
    wait_until("b to replicate the room", move || {
        b_replica.get("R").map(|r| r.count) == Some(1)
    })
    .await;
    assert_eq!(b.node.replica().get_version(&tag()), 1);

    assert!(a.node.locks().is_empty());
    assert!(b.node.locks().is_empty());
}

#[tokio::test]
async fn join_from_another_node_bumps_the_count() {
    let (_hub, coordinator, a, b) = two_nodes().await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();

    let b_replica = b.node.replica().clone();
    wait_until("b to replicate the room", move || b_replica.get("R").is_some()).await;

    // The join request lands on b before its engine knows the room: the
    // pipe materializes a shell from the replica.
    assert!(!b.platform.has_room_named("R"));
    b.node.pipe_before_join("R").await;
    assert!(b.platform.has_room_named("R"));

    b.node
        .pipe_subscription_joined(JoinDiff {
            index: "idx".into(),
            collection: "col".into(),
            room_id: "R".into(),
            connection_id: "conn-2".into(),
            changed: true,
        })
        .await
        .unwrap();

    assert_eq!(coordinator.version(&tag()), 2);
    assert_eq!(b.node.replica().get("R").unwrap().count, 2);
    let a_replica = a.node.replica().clone();
    wait_until("a to see count 2", move || {
        a_replica.get("R").map(|r| r.count) == Some(2)
    })
    .await;
}

#[tokio::test]
async fn concurrent_subscribes_on_one_tag_all_land() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.hook_room_created("R1");
    a.node.hook_room_created("R2");

    // Both commits target the same (index, collection); the per-tag lock
    // serializes them, so neither replica update is dropped by the
    // version guard.
    let (n1, n2) = (a.node.clone(), a.node.clone());
    let (first, second) = tokio::join!(
        n1.pipe_subscription_added(sub_diff("R1", "conn-1")),
        n2.pipe_subscription_added(sub_diff("R2", "conn-2")),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(a.node.replica().get("R1").unwrap().count, 1);
    assert_eq!(a.node.replica().get("R2").unwrap().count, 1);
    assert_eq!(a.node.replica().get_version(&tag()), 2);
    assert!(a.node.locks().is_empty());
}

#[tokio::test]
async fn unsubscribe_propagates_and_releases_the_lock() {
    let (_hub, coordinator, a, b) = two_nodes().await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    b.node
        .pipe_subscription_joined(JoinDiff {
            index: "idx".into(),
            collection: "col".into(),
            room_id: "R".into(),
            connection_id: "conn-2".into(),
            changed: true,
        })
        .await
        .unwrap();

    b.node.hook_room_removed("R");
    b.node
        .pipe_subscription_off(UnsubscribeDiff {
            index: "idx".into(),
            collection: "col".into(),
            room_id: "R".into(),
            connection_id: "conn-2".into(),
        })
        .await
        .unwrap();

    assert_eq!(coordinator.version(&tag()), 3);
    assert_eq!(b.node.replica().get("R").unwrap().count, 1);
    assert!(b.node.locks().is_empty());

    let a_replica = a.node.replica().clone();
    wait_until("a to see count 1", move || {
        a_replica.get("R").map(|r| r.count) == Some(1)
    })
    .await;
}

#[tokio::test]
async fn dead_peer_is_swept_by_its_survivors() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    // c heartbeats once at startup and then goes silent for a minute,
    // which is a crash as far as the fleet is concerned.
    let mut lazy = fast_timers();
    lazy.heartbeat_interval_ms = 60_000;
    let c = spawn_node(&hub, &coordinator, "c", lazy).await;

    let a_node = a.node.clone();
    wait_until("a to see c", move || a_node.pool_size() == 1).await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    c.node
        .pipe_subscription_joined(JoinDiff {
            index: "idx".into(),
            collection: "col".into(),
            room_id: "R".into(),
            connection_id: "conn-2".into(),
            changed: true,
        })
        .await
        .unwrap();
    assert_eq!(coordinator.version(&tag()), 2);

    let a_node = a.node.clone();
    wait_until("a to sweep c", move || a_node.pool_size() == 0).await;

    assert_eq!(coordinator.version(&tag()), 3);
    let (_, rooms) = coordinator.get_state(&tag()).await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].count, 1);

    let a_replica = a.node.replica().clone();
    wait_until("a to drop c's subscriber", move || {
        a_replica.get("R").map(|r| r.count) == Some(1)
    })
    .await;
}

#[tokio::test]
async fn list_override_sorts_on_request() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    let replica = a.node.replica();
    replica.set_room_count("i2", "c2", "R1", 4);
    replica.set_room_count("i1", "c1", "R2", 2);
    replica.set_room_count("i1", "c2", "R3", 3);

    let listed = a.overrides.list("caller", true).await.unwrap();
    assert_eq!(
        serde_json::to_string(&listed).unwrap(),
        r#"{"i1":{"c1":{"R2":2},"c2":{"R3":3}},"i2":{"c2":{"R1":4}}}"#
    );
}

#[tokio::test]
async fn list_override_respects_permissions() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    let replica = a.node.replica();
    replica.set_room_count("i1", "c1", "R1", 1);
    replica.set_room_count("i1", "c2", "R2", 2);
    a.platform.deny_search("i1", "c1");

    let listed = a.overrides.list("caller", true).await.unwrap();
    assert_eq!(listed, json!({"i1": {"c2": {"R2": 2}}}));
}

#[tokio::test]
async fn count_override_waits_out_replication_lag() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    // The room lands in the replica only after the first lookup missed.
    let replica = a.node.replica().clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        replica.set_room_count("idx", "col", "R", 1);
    });

    assert_eq!(a.overrides.count(Some("R")).await.unwrap(), 1);

    assert!(matches!(
        a.overrides.count(None).await,
        Err(murmur_node::NodeError::InvalidInput(_))
    ));
    assert!(matches!(
        a.overrides.count(Some("missing")).await,
        Err(murmur_node::NodeError::NotFound(_))
    ));
}

#[tokio::test]
async fn room_teardown_waits_for_the_fleet() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.replica().set_room_count("idx", "col", "R", 2);
    assert!(!a.overrides.should_remove_room("R"));

    a.node.replica().set_room_count("idx", "col", "R", 1);
    assert!(a.overrides.should_remove_room("R"));
    assert!(a.overrides.should_remove_room("unknown"));
}

#[tokio::test]
async fn strategies_replicate_both_ways() {
    let (_hub, _coordinator, a, b) = two_nodes().await;

    let def = StrategyDef {
        plugin: "auth-plugin".into(),
        strategy: json!({"config": {"algorithm": "sha512"}}),
    };
    a.node.pipe_strategy_added("oauth", &def).await.unwrap();

    let peer = b.platform.clone();
    wait_until("b to register the strategy", move || {
        peer.strategy_names().contains("oauth")
    })
    .await;

    a.node.pipe_strategy_removed("oauth").await.unwrap();
    let peer = b.platform.clone();
    wait_until("b to unregister the strategy", move || {
        !peer.strategy_names().contains("oauth")
    })
    .await;
}

#[tokio::test]
async fn cache_events_reach_peer_hosts() {
    let (_hub, _coordinator, a, b) = two_nodes().await;

    a.node.hook_profile_changed("profile-1").await;
    a.node.hook_role_changed("role-1").await;
    a.node.hook_validators_changed().await;
    a.node.hook_index_cache_added("idx", Some("col")).await;

    let peer = b.platform.clone();
    wait_until("b to apply cache events", move || {
        peer.invalidated_profiles.lock().unwrap().contains(&"profile-1".to_string())
            && peer.invalidated_roles.lock().unwrap().contains(&"role-1".to_string())
            && peer.validator_reloads.load(std::sync::atomic::Ordering::SeqCst) == 1
            && !peer.index_cache_ops.lock().unwrap().is_empty()
    })
    .await;

    // Peer-driven index cache updates must not re-propagate.
    let ops = b.platform.index_cache_ops.lock().unwrap();
    assert_eq!(ops[0], ("add".to_string(), "idx".to_string(), Some("col".to_string()), false));
}

#[tokio::test]
async fn notifications_and_admin_actions_fan_out() {
    let (_hub, _coordinator, a, b) = two_nodes().await;

    a.node
        .hook_notify_document(&murmur_model::DocumentNotification {
            rooms: vec!["R".into()],
            payload: json!({"action": "create"}),
        })
        .await;
    a.node.hook_admin_dump("2020-01-01").await;
    a.node.hook_admin_reset_security().await;

    let peer = b.platform.clone();
    wait_until("b to receive notification and admin events", move || {
        !peer.documents.lock().unwrap().is_empty()
            && peer.dumps.lock().unwrap().contains(&"2020-01-01".to_string())
            && peer.security_resets.load(std::sync::atomic::Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn fleet_shutdown_reaches_every_peer() {
    let (_hub, _coordinator, a, b) = two_nodes().await;

    a.node.hook_admin_shutdown().await;

    let peer = b.platform.clone();
    let b_node = b.node.clone();
    wait_until("b to shut down", move || {
        peer.shutdowns.load(std::sync::atomic::Ordering::SeqCst) == 1 && b_node.is_shutdown()
    })
    .await;
}

#[tokio::test]
async fn last_node_out_resets_instead_of_sweeping() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    assert_eq!(coordinator.version(&tag()), 1);

    a.node.shutdown_node().await;

    // The replica is wiped locally, and no cleanNode ran: the coordinator
    // still holds the room at the same version.
    assert_eq!(a.node.replica().room_count(), 0);
    assert_eq!(coordinator.version(&tag()), 1);
    let (_, rooms) = coordinator.get_state(&tag()).await.unwrap();
    assert_eq!(rooms.len(), 1);
}

#[tokio::test]
async fn shutdown_with_survivors_sweeps_own_rooms() {
    let (_hub, coordinator, a, b) = two_nodes().await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    b.node
        .pipe_subscription_joined(JoinDiff {
            index: "idx".into(),
            collection: "col".into(),
            room_id: "R".into(),
            connection_id: "conn-2".into(),
            changed: true,
        })
        .await
        .unwrap();

    a.node.shutdown_node().await;

    assert_eq!(coordinator.version(&tag()), 3);
    let (_, rooms) = coordinator.get_state(&tag()).await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].count, 1);

    let b_replica = b.node.replica().clone();
    wait_until("b to drop a's subscriber", move || {
        b_replica.get("R").map(|r| r.count) == Some(1)
    })
    .await;
}

#[tokio::test]
async fn failed_coordinator_write_releases_the_lock_and_leaves_state_alone() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.hook_room_created("R");
    coordinator.fail_next_call();
    let result = a
        .node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await;
    assert!(result.is_err());

    // The lock is gone and the replica untouched.
    assert!(a.node.locks().is_empty());
    assert_eq!(a.node.replica().room_count(), 0);
    assert_eq!(coordinator.version(&tag()), 0);
}

#[tokio::test]
async fn new_node_hydrates_existing_state() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    let def = StrategyDef {
        plugin: "auth-plugin".into(),
        strategy: json!({}),
    };
    a.node.pipe_strategy_added("oauth", &def).await.unwrap();

    // A node joining later seeds its replica and strategy registry from
    // the coordinator, not from peer chatter.
    let late = spawn_node(&hub, &coordinator, "late", fast_timers()).await;
    assert_eq!(late.node.replica().get("R").unwrap().count, 1);
    assert!(late.platform.strategy_names().contains("oauth"));
}

#[tokio::test]
async fn shutdown_supervisor_fires_once() {
    // A second trigger of the shutdown supervisor is a no-op.
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    a.node.shutdown_node().await;
    a.node.replica().set_room_count("idx", "col", "R", 1);
    a.node.shutdown_node().await;
    // Had the supervisor run twice, the reset would have wiped this.
    assert_eq!(a.node.replica().room_count(), 1);
}
