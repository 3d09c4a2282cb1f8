//! Sync-engine edge behavior: forward compatibility, replay, join waits.

mod common;

use common::{fast_timers, spawn_node, wait_until};
use murmur_coordinator::MemoryCoordinator;
use murmur_model::{IndexCollection, Topic};
use murmur_net::ChannelHub;
use murmur_node::bindings::SubscriptionDiff;
use serde_json::json;
use std::sync::Arc;

fn sub_diff(room: &str, conn: &str) -> SubscriptionDiff {
    SubscriptionDiff {
        index: "idx".into(),
        collection: "col".into(),
        room_id: room.into(),
        connection_id: conn.into(),
        filter: None,
    }
}

#[tokio::test]
async fn unknown_sync_events_are_ignored_not_fatal() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;
    let b = spawn_node(&hub, &coordinator, "b", fast_timers()).await;

    let (a_node, b_node) = (a.node.clone(), b.node.clone());
    wait_until("nodes to see each other", move || {
        a_node.pool_size() == 1 && b_node.pool_size() == 1
    })
    .await;

    // An event from some future version of the fleet.
    a.node
        .broadcast(Topic::Sync, json!({"event": "state:v2", "index": "x"}))
        .await
        .unwrap();
    a.node
        .broadcast(Topic::Sync, json!({"no_event_field": true}))
        .await
        .unwrap();

    // b keeps working: a real event right behind them still lands.
    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();

    let b_replica = b.node.replica().clone();
    wait_until("b to replicate past the junk", move || {
        b_replica.get("R").is_some()
    })
    .await;
    assert_eq!(b.node.replica().room_count(), 1);
}

#[tokio::test]
async fn replayed_state_events_do_not_reapply() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;
    let b = spawn_node(&hub, &coordinator, "b", fast_timers()).await;

    let (a_node, b_node) = (a.node.clone(), b.node.clone());
    wait_until("nodes to see each other", move || {
        a_node.pool_size() == 1 && b_node.pool_size() == 1
    })
    .await;

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    let b_replica = b.node.replica().clone();
    wait_until("b to replicate", move || b_replica.get("R").is_some()).await;

    // Poison b's local copy without touching the version. A replayed
    // event must not trigger a re-pull, so the sentinel survives.
    b.node.replica().set_room_count("idx", "col", "R", 99);
    a.node
        .broadcast(
            Topic::Sync,
            json!({"event": "state", "index": "idx", "collection": "col", "post": "add"}),
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(b.node.replica().get("R").unwrap().count, 99);
}

#[tokio::test]
async fn locked_rooms_survive_a_state_pull() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;
    let b = spawn_node(&hub, &coordinator, "b", fast_timers()).await;

    let (a_node, b_node) = (a.node.clone(), b.node.clone());
    wait_until("nodes to see each other", move || {
        a_node.pool_size() == 1 && b_node.pool_size() == 1
    })
    .await;

    // b is in the middle of creating "local-room": sync must not touch it.
    b.node.hook_room_created("local-room");
    b.node.replica().set_room_count("idx", "col", "local-room", 1);

    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();

    let b_replica = b.node.replica().clone();
    wait_until("b to replicate R", move || b_replica.get("R").is_some()).await;

    // The locked room was spared even though the coordinator snapshot
    // knows nothing about it.
    assert_eq!(b.node.replica().get("local-room").unwrap().count, 1);
    b.node.hook_subscribe_failed("local-room");
    assert!(b.node.locks().is_empty());
}

#[tokio::test]
async fn before_join_waits_once_then_proceeds() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    let started = std::time::Instant::now();
    a.node.pipe_before_join("ghost").await;
    let elapsed = started.elapsed();

    // One join_attempt_interval wait, no materialization: the request is
    // left to fail downstream.
    assert!(elapsed >= std::time::Duration::from_millis(50));
    assert!(!a.platform.has_room_named("ghost"));
}

#[tokio::test]
async fn hooks_before_ready_drop_instead_of_failing() {
    let coordinator: Arc<MemoryCoordinator> = Arc::new(MemoryCoordinator::new());
    let platform = Arc::new(common::MockPlatform::default());
    let node = murmur_node::ClusterNode::new(
        murmur_model::ClusterConfig::default(),
        coordinator as Arc<dyn murmur_coordinator::Coordinator>,
        Arc::new(murmur_net::ChannelTransport::new(ChannelHub::new())),
        platform.platform(),
    );

    // Never started, never ready: broadcast hooks drop silently, lock
    // hooks still work.
    assert!(!node.is_ready());
    node.hook_profile_changed("p1").await;
    node.hook_validators_changed().await;
    node.hook_room_created("R");
    assert!(!node.locks().is_empty());
    node.hook_subscribe_failed("R");
    assert!(node.locks().is_empty());
}

#[tokio::test]
async fn version_guard_holds_across_a_tag() {
    let hub = ChannelHub::new();
    let coordinator = Arc::new(MemoryCoordinator::new());
    let a = spawn_node(&hub, &coordinator, "a", fast_timers()).await;

    let tag = IndexCollection::new("idx", "col");
    a.node.hook_room_created("R");
    a.node
        .pipe_subscription_added(sub_diff("R", "conn-1"))
        .await
        .unwrap();
    assert_eq!(a.node.replica().get_version(&tag), 1);

    a.node.hook_room_created("R2");
    a.node
        .pipe_subscription_added(sub_diff("R2", "conn-2"))
        .await
        .unwrap();
    assert_eq!(a.node.replica().get_version(&tag), 2);
}
