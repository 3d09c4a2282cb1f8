//! Cluster node: local membership and the loops that keep it honest.
//!
//! Owns the peer pool, the state replica and the sync engine. Startup
//! binds the transport, joins discovery, dials every known peer, hydrates
//! strategies, seeds the replica and announces readiness; after that a
//! heartbeat emitter, a staleness sweeper and the inbound dispatcher run
//! until shutdown.

use crate::error::NodeError;
use crate::platform::Platform;
use crate::shutdown::{shutdown_signal, ShutdownGuard};
use crate::state::{PendingLocks, StateReplica, TagLocks};
use crate::sync::SyncEngine;
use murmur_coordinator::Coordinator;
use murmur_model::{
    ClusterConfig, DocumentNotification, Heartbeat, IndexCollection, NodeDescriptor, PeerBinding,
    SyncEvent, Topic, UserNotification,
};
use murmur_net::{Frame, Inbound, Transport};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What we know about a live peer.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub binding: PeerBinding,
    pub birthdate: i64,
    pub last_seen: Instant,
}

pub struct ClusterNode {
    pub(crate) uuid: Uuid,
    pub(crate) birthdate: i64,
    pub(crate) config: ClusterConfig,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) platform: Platform,
    pub(crate) replica: Arc<StateReplica>,
    pub(crate) locks: Arc<PendingLocks>,
    pub(crate) tag_locks: Arc<TagLocks>,
    pub(crate) sync: SyncEngine,
    descriptor: RwLock<Option<NodeDescriptor>>,
    pool: RwLock<HashMap<Uuid, PeerState>>,
    ready: AtomicBool,
    pub(crate) shutdown: Arc<ShutdownGuard>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    pub fn new(
        config: ClusterConfig,
        coordinator: Arc<dyn Coordinator>,
        transport: Arc<dyn Transport>,
        platform: Platform,
    ) -> Arc<Self> {
        let replica = Arc::new(StateReplica::new());
        let locks = Arc::new(PendingLocks::new());
        let tag_locks = Arc::new(TagLocks::new());
        let sync = SyncEngine::new(
            coordinator.clone(),
            replica.clone(),
            locks.clone(),
            tag_locks.clone(),
            platform.clone(),
        );
        let birthdate = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Arc::new(Self {
            uuid: Uuid::new_v4(),
            birthdate,
            config,
            coordinator,
            transport,
            platform,
            replica,
            locks,
            tag_locks,
            sync,
            descriptor: RwLock::new(None),
            pool: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            shutdown: Arc::new(ShutdownGuard::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ==================== Accessors ====================

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn replica(&self) -> &Arc<StateReplica> {
        &self.replica
    }

    pub fn locks(&self) -> &Arc<PendingLocks> {
        &self.locks
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn pool_size(&self) -> usize {
        self.pool_read().len()
    }

    /// Snapshot of the peer pool.
    pub fn pool(&self) -> Vec<(Uuid, PeerState)> {
        self.pool_read()
            .iter()
            .map(|(uuid, peer)| (*uuid, peer.clone()))
            .collect()
    }

    fn pool_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, PeerState>> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, PeerState>> {
        self.pool.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn own_binding(&self) -> Option<PeerBinding> {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| d.binding())
    }

    fn heartbeat_payload(&self) -> Option<Heartbeat> {
        self.descriptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| Heartbeat {
                uuid: d.uuid,
                birthdate: d.birthdate,
                pub_addr: d.pub_addr.clone(),
                router_addr: d.router_addr.clone(),
            })
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    // ==================== Startup ====================

    /// Bring the node into the fleet. Fatal errors abort startup; a node
    /// that returns `Ok` is ready and announced.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let (bound, inbound) = self
            .transport
            .bind(&self.config.bindings.pub_addr, &self.config.bindings.router)
            .await?;

        let descriptor = NodeDescriptor {
            uuid: self.uuid,
            pub_addr: bound.pub_addr,
            router_addr: bound.router_addr,
            birthdate: self.birthdate,
        };
        tracing::info!(
            node = %self.uuid,
            publisher = %descriptor.pub_addr,
            router = %descriptor.router_addr,
            "cluster node starting"
        );
        *self
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(descriptor.clone());

        self.coordinator.add_node(&descriptor).await?;

        // Dial everyone already advertised. Peers identify themselves via
        // heartbeat; the pool fills up as those arrive.
        let own = descriptor.binding();
        let peers: Vec<PeerBinding> = self
            .coordinator
            .discover()
            .await?
            .into_iter()
            .filter(|peer| *peer != own)
            .collect();
        for peer in &peers {
            if let Err(e) = self.transport.subscribe(peer).await {
                tracing::warn!(peer = %peer.pub_addr, error = %e, "could not dial peer");
            }
        }

        self.hydrate_strategies().await?;
        self.sync.pull_all().await?;

        // Announce readiness on our publisher (for anyone already
        // following us) and knock on every discovered router directly:
        // those peers cannot follow our publisher before they know we
        // exist.
        if let Some(heartbeat) = self.heartbeat_payload() {
            let frame = Frame::encode(Topic::Ready, &heartbeat)?;
            self.transport.publish(&frame).await?;
            for peer in &peers {
                if let Err(e) = self.transport.request(peer, &frame).await {
                    tracing::warn!(peer = %peer.router_addr, error = %e, "ready announcement failed");
                }
            }
        }
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(node = %self.uuid, "cluster node ready");

        self.spawn_dispatcher(inbound);
        self.spawn_heartbeat();
        self.spawn_sweeper();
        Ok(())
    }

    /// Register every strategy the fleet knows that we do not.
    async fn hydrate_strategies(&self) -> Result<(), NodeError> {
        let known: std::collections::HashSet<String> =
            self.platform.strategies.registered().into_iter().collect();
        for (name, def) in self.coordinator.strategies().await? {
            if !known.contains(&name) {
                tracing::info!(strategy = %name, "hydrating strategy from the fleet");
                self.platform.strategies.register(&name, &def);
            }
        }
        Ok(())
    }

    // ==================== Messaging ====================

    /// Fan a payload out to every peer.
    pub async fn broadcast(
        &self,
        topic: Topic,
        payload: serde_json::Value,
    ) -> Result<(), NodeError> {
        self.transport.publish(&Frame::new(topic, payload)).await?;
        Ok(())
    }

    /// One request/reply exchange against a specific peer's router.
    pub async fn send(
        &self,
        peer: Uuid,
        topic: Topic,
        payload: serde_json::Value,
    ) -> Result<Frame, NodeError> {
        let binding = self
            .pool_read()
            .get(&peer)
            .map(|p| p.binding.clone())
            .ok_or(NodeError::UnknownPeer(peer))?;
        Ok(self
            .transport
            .request(&binding, &Frame::new(topic, payload))
            .await?)
    }

    pub(crate) async fn send_sync(&self, event: &SyncEvent) -> Result<(), NodeError> {
        self.transport
            .publish(&Frame::encode(Topic::Sync, event)?)
            .await?;
        Ok(())
    }

    /// Broadcast a `state:all` round so every peer re-pulls.
    pub async fn sync_all(&self, post: Option<&str>) -> Result<(), NodeError> {
        self.send_sync(&SyncEvent::StateAll {
            post: post.map(str::to_string),
        })
        .await
    }

    /// Apply a scripted update's result to the replica, guarded by the
    /// version counter.
    pub(crate) fn apply_room_update(
        &self,
        tag: &IndexCollection,
        room_id: &str,
        version: u64,
        count: u64,
    ) {
        if self.replica.set_version(tag, version) {
            if count == 0 {
                self.replica.delete_room_count(room_id);
            } else {
                self.replica
                    .set_room_count(&tag.index, &tag.collection, room_id, count);
            }
        }
    }

    // ==================== Background loops ====================

    fn spawn_dispatcher(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            mut frames,
            mut requests,
        } = inbound;

        let node = self.clone();
        self.push_task(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if node.shutdown.is_shutdown() {
                    break;
                }
                node.dispatch(frame).await;
            }
        }));

        let node = self.clone();
        self.push_task(tokio::spawn(async move {
            while let Some((frame, reply)) = requests.recv().await {
                if node.shutdown.is_shutdown() {
                    break;
                }
                node.dispatch(frame).await;
                let _ = reply.send(Frame {
                    topic: "cluster:ack".into(),
                    payload: json!({"ok": true}),
                });
            }
        }));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = self.clone();
        self.push_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.timers.heartbeat_interval());
            loop {
                interval.tick().await;
                if node.shutdown.is_shutdown() {
                    break;
                }
                let Some(heartbeat) = node.heartbeat_payload() else { break };
                match Frame::encode(Topic::Heartbeat, &heartbeat) {
                    Ok(frame) => {
                        if let Err(e) = node.transport.publish(&frame).await {
                            tracing::debug!(error = %e, "heartbeat publish failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "heartbeat encode failed"),
                }
            }
        }));
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let node = self.clone();
        self.push_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.timers.heartbeat_interval());
            loop {
                interval.tick().await;
                if node.shutdown.is_shutdown() {
                    break;
                }
                let timeout = node.config.timers.heartbeat_timeout();
                let stale: Vec<(Uuid, PeerState)> = {
                    let mut pool = node.pool_write();
                    let gone: Vec<Uuid> = pool
                        .iter()
                        .filter(|(_, peer)| peer.last_seen.elapsed() > timeout)
                        .map(|(uuid, _)| *uuid)
                        .collect();
                    gone.into_iter()
                        .filter_map(|uuid| pool.remove(&uuid).map(|peer| (uuid, peer)))
                        .collect()
                };
                for (uuid, peer) in stale {
                    tracing::warn!(peer = %uuid, "peer heartbeat timed out, sweeping");
                    node.transport.unsubscribe(&peer.binding).await;
                    if let Err(e) = node.coordinator.remove_node(&peer.binding).await {
                        tracing::warn!(peer = %uuid, error = %e, "could not drop peer from discovery");
                    }
                    node.clean_peer(uuid).await;
                }
            }
        }));
    }

    /// Best-effort sweep of a dead peer's memberships. The script is
    /// idempotent, so a second cleaner racing us does nothing harmful.
    async fn clean_peer(&self, peer: Uuid) {
        let tags = match self.coordinator.collections().await {
            Ok(tags) => tags,
            Err(e) => {
                tracing::warn!(error = %e, "collections unavailable, sweeping from local tree");
                self.replica.tags()
            }
        };
        for tag in &tags {
            if let Err(e) = self.coordinator.clean_node(tag, peer).await {
                tracing::warn!(peer = %peer, tag = %tag, error = %e, "cleanup script failed");
            }
        }
        self.sync.refresh_all().await;
        if let Err(e) = self.sync_all(None).await {
            tracing::warn!(error = %e, "could not broadcast state refresh");
        }
    }

    // ==================== Inbound dispatch ====================

    async fn dispatch(&self, frame: Frame) {
        match frame.topic() {
            Some(Topic::Heartbeat) => self.on_peer_alive(frame.payload, false).await,
            Some(Topic::Ready) => self.on_peer_alive(frame.payload, true).await,
            Some(Topic::Sync) => self.sync.handle(&frame.payload).await,
            Some(Topic::NotifyDocument) => {
                match serde_json::from_value::<DocumentNotification>(frame.payload) {
                    Ok(notification) => self.platform.realtime.dispatch_document(&notification),
                    Err(e) => tracing::warn!(error = %e, "malformed document notification"),
                }
            }
            Some(Topic::NotifyUser) => {
                match serde_json::from_value::<UserNotification>(frame.payload) {
                    Ok(notification) => self.platform.realtime.dispatch_user(&notification),
                    Err(e) => tracing::warn!(error = %e, "malformed user notification"),
                }
            }
            Some(Topic::AdminResetSecurity) => self.platform.admin.reset_security(),
            Some(Topic::AdminDump) => {
                let suffix = frame
                    .payload
                    .get("suffix")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                self.platform.admin.dump(suffix);
            }
            Some(Topic::AdminShutdown) => {
                tracing::info!("fleet-wide shutdown received");
                self.shutdown_node().await;
                self.platform.admin.shutdown();
            }
            None => tracing::warn!(topic = %frame.topic, "ignoring unknown topic"),
        }
    }

    /// A heartbeat or ready announcement: refresh the pool, dial newcomers.
    async fn on_peer_alive(&self, payload: serde_json::Value, announced: bool) {
        let heartbeat = match serde_json::from_value::<Heartbeat>(payload) {
            Ok(hb) => hb,
            Err(e) => {
                tracing::warn!(error = %e, "malformed heartbeat");
                return;
            }
        };
        if heartbeat.uuid == self.uuid {
            return;
        }
        let binding = heartbeat.binding();
        let newcomer = {
            let mut pool = self.pool_write();
            match pool.get_mut(&heartbeat.uuid) {
                Some(peer) => {
                    peer.last_seen = Instant::now();
                    if peer.birthdate != heartbeat.birthdate {
                        // Restarted peer: refresh what we know about it.
                        peer.birthdate = heartbeat.birthdate;
                        peer.binding = binding.clone();
                        true
                    } else {
                        false
                    }
                }
                None => {
                    pool.insert(
                        heartbeat.uuid,
                        PeerState {
                            binding: binding.clone(),
                            birthdate: heartbeat.birthdate,
                            last_seen: Instant::now(),
                        },
                    );
                    true
                }
            }
        };
        if newcomer {
            if announced {
                tracing::info!(peer = %heartbeat.uuid, "peer is ready");
            } else {
                tracing::info!(peer = %heartbeat.uuid, "peer joined the fleet");
            }
            if let Err(e) = self.transport.subscribe(&binding).await {
                tracing::warn!(peer = %heartbeat.uuid, error = %e, "could not dial peer");
            }
        }
    }

    // ==================== Shutdown ====================

    /// At-most-once fleet exit. Removes this node from discovery, sweeps
    /// its memberships (unless it is the last node, which wipes the
    /// replica instead) and tells survivors to refresh. Best-effort: the
    /// platform is exiting, failures are logged and never retried.
    pub async fn shutdown_node(&self) {
        if !self.shutdown.begin() {
            return;
        }
        tracing::info!(node = %self.uuid, "cluster node shutting down");
        self.ready.store(false, Ordering::SeqCst);

        if let Some(binding) = self.own_binding() {
            if let Err(e) = self.coordinator.remove_node(&binding).await {
                tracing::warn!(error = %e, "could not leave discovery");
            }
        }

        let last_node_out = self.pool_read().is_empty();
        if last_node_out {
            // Nobody left to tell: wipe the room data and go.
            self.replica.reset();
        } else {
            for tag in self.replica.tags() {
                if let Err(e) = self.coordinator.clean_node(&tag, self.uuid).await {
                    tracing::warn!(tag = %tag, error = %e, "cleanup failed, peers will sweep");
                }
            }
            if let Err(e) = self.sync_all(None).await {
                tracing::warn!(error = %e, "could not broadcast final state refresh");
            }
        }

        self.transport.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Wire fatal signals to the shutdown supervisor. In development mode
    /// a panic anywhere in the process also trips the flag, so background
    /// loops stop instead of limping on.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let node = self.clone();
        self.push_task(tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("fatal signal received");
            node.shutdown_node().await;
            node.platform.admin.shutdown();
        }));

        if self.config.development {
            let guard = self.shutdown.clone();
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                if guard.begin() {
                    tracing::error!("panic in development mode, flagging cluster shutdown");
                }
                previous(info);
            }));
        }
    }
}
