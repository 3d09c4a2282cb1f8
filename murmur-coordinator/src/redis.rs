//! Redis-backed coordinator.
//!
//! Works against a single instance (auto-reconnecting connection manager)
//! or a sharded cluster. The four scripted operations live in
//! `scripts/*.lua` and are embedded at compile time; every key they touch
//! carries the `{index/collection}` hash tag, so cluster mode routes one
//! call to one slot and script atomicity holds.

use crate::{
    Coordinator, CoordinatorError, COLLECTIONS_KEY, DISCOVERY_KEY, STRATEGIES_KEY,
};
use ::redis::aio::{ConnectionLike, ConnectionManager};
use ::redis::cluster::ClusterClient;
use ::redis::cluster_async::ClusterConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use murmur_model::{IndexCollection, NodeDescriptor, PeerBinding, RedisConfig, RoomSnapshot, StrategyDef};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

const SETUP_RETRIES: u32 = 4;
const SETUP_BACKOFF: Duration = Duration::from_millis(200);

/// One connection handle, single-node or cluster.
#[derive(Clone)]
enum Conn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a ::redis::Cmd,
    ) -> ::redis::RedisFuture<'a, ::redis::Value> {
        match self {
            Conn::Single(c) => c.req_packed_command(cmd),
            Conn::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a ::redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> ::redis::RedisFuture<'a, Vec<::redis::Value>> {
        match self {
            Conn::Single(c) => c.req_packed_commands(cmd, offset, count),
            Conn::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Conn::Single(c) => c.get_db(),
            Conn::Cluster(c) => c.get_db(),
        }
    }
}

struct Scripts {
    sub_on: Script,
    sub_off: Script,
    clean_node: Script,
    get_state: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            sub_on: Script::new(include_str!("../scripts/subOn.lua")),
            sub_off: Script::new(include_str!("../scripts/suboff.lua")),
            clean_node: Script::new(include_str!("../scripts/cleanNode.lua")),
            get_state: Script::new(include_str!("../scripts/getState.lua")),
        }
    }
}

pub struct RedisCoordinator {
    conn: Conn,
    scripts: Scripts,
}

impl RedisCoordinator {
    /// Connect to the coordinator store: one configured node means a single
    /// instance, several mean cluster mode.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CoordinatorError> {
        let conn = match config.nodes.as_slice() {
            [] => {
                return Err(CoordinatorError::Protocol(
                    "no coordinator nodes configured".into(),
                ))
            }
            [node] => {
                let client = ::redis::Client::open(node.as_str())?;
                Conn::Single(ConnectionManager::new(client).await?)
            }
            nodes => {
                let client = ClusterClient::new(nodes.to_vec())?;
                Conn::Cluster(client.get_async_connection().await?)
            }
        };
        Ok(Self {
            conn,
            scripts: Scripts::load(),
        })
    }
}

// ==================== Key layout ====================

fn k_version(tag: &IndexCollection) -> String {
    format!("cluster:{}:version", tag.tag())
}

fn k_rooms(tag: &IndexCollection) -> String {
    format!("cluster:{}:rooms", tag.tag())
}

/// Prefix for per-room connection sets; the scripts append
/// `<room>:conns[:<node>]`.
fn k_room_prefix(tag: &IndexCollection) -> String {
    format!("cluster:{}:room:", tag.tag())
}

fn k_room_conns(tag: &IndexCollection, room_id: &str) -> String {
    format!("{}{}:conns", k_room_prefix(tag), room_id)
}

fn k_room_conns_node(tag: &IndexCollection, room_id: &str, node: Uuid) -> String {
    format!("{}:{}", k_room_conns(tag, room_id), node)
}

fn k_node(tag: &IndexCollection, node: Uuid) -> String {
    format!("cluster:{}:node:{}", tag.tag(), node)
}

fn k_filters(tag: &IndexCollection) -> String {
    format!("cluster:{}:filters", tag.tag())
}

fn parse_filter(raw: &str) -> Option<serde_json::Value> {
    if raw == "none" {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "dropping unparseable room filter");
            None
        }
    }
}

/// Bounded-backoff retry for idempotent setup operations. Hot-path script
/// calls never come through here, their failures surface to the caller.
async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T, CoordinatorError>
where
    Fut: Future<Output = Result<T, CoordinatorError>>,
{
    let mut delay = SETUP_BACKOFF;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(CoordinatorError::Transient(reason)) if attempt < SETUP_RETRIES => {
                attempt += 1;
                tracing::warn!(%reason, attempt, "coordinator call failed, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            other => return other,
        }
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn add_node(&self, node: &NodeDescriptor) -> Result<(), CoordinatorError> {
        let entry = serde_json::to_string(&node.binding())?;
        with_retry(|| {
            let entry = entry.clone();
            let mut conn = self.conn.clone();
            async move {
                let _: () = conn.sadd(DISCOVERY_KEY, entry).await?;
                Ok(())
            }
        })
        .await
    }

    async fn remove_node(&self, binding: &PeerBinding) -> Result<(), CoordinatorError> {
        let entry = serde_json::to_string(binding)?;
        let mut conn = self.conn.clone();
        let _: () = conn.srem(DISCOVERY_KEY, entry).await?;
        Ok(())
    }

    async fn discover(&self) -> Result<Vec<PeerBinding>, CoordinatorError> {
        let entries: Vec<String> = with_retry(|| {
            let mut conn = self.conn.clone();
            async move { Ok(conn.smembers(DISCOVERY_KEY).await?) }
        })
        .await?;

        Ok(entries
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed discovery entry");
                    None
                }
            })
            .collect())
    }

    async fn sub_on(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
        filter: Option<&serde_json::Value>,
    ) -> Result<(u64, u64), CoordinatorError> {
        let filter_arg = match filter {
            Some(f) => serde_json::to_string(f)?,
            None => "none".into(),
        };
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.sub_on.prepare_invoke();
        inv.key(k_version(tag))
            .key(k_rooms(tag))
            .key(k_room_conns(tag, room_id))
            .key(k_room_conns_node(tag, room_id, node))
            .key(k_node(tag, node))
            .key(k_filters(tag))
            .arg(room_id)
            .arg(connection_id)
            .arg(filter_arg);
        Ok(inv.invoke_async(&mut conn).await?)
    }

    async fn sub_off(
        &self,
        tag: &IndexCollection,
        node: Uuid,
        room_id: &str,
        connection_id: &str,
    ) -> Result<(u64, u64), CoordinatorError> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.sub_off.prepare_invoke();
        inv.key(k_version(tag))
            .key(k_rooms(tag))
            .key(k_room_conns(tag, room_id))
            .key(k_room_conns_node(tag, room_id, node))
            .key(k_node(tag, node))
            .key(k_filters(tag))
            .arg(room_id)
            .arg(connection_id);
        Ok(inv.invoke_async(&mut conn).await?)
    }

    async fn clean_node(&self, tag: &IndexCollection, node: Uuid) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.clean_node.prepare_invoke();
        inv.key(k_version(tag))
            .key(k_rooms(tag))
            .key(k_node(tag, node))
            .key(k_filters(tag))
            .arg(k_room_prefix(tag))
            .arg(node.to_string());
        let _: () = inv.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn get_state(
        &self,
        tag: &IndexCollection,
    ) -> Result<(u64, Vec<RoomSnapshot>), CoordinatorError> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.get_state.prepare_invoke();
        inv.key(k_version(tag))
            .key(k_rooms(tag))
            .key(k_filters(tag))
            .arg(k_room_prefix(tag));
        let (version, rows): (u64, Vec<(String, u64, String)>) =
            inv.invoke_async(&mut conn).await?;

        let rooms = rows
            .into_iter()
            .map(|(room_id, count, filter)| RoomSnapshot {
                room_id,
                count,
                filter: parse_filter(&filter),
            })
            .collect();
        Ok((version, rooms))
    }

    async fn set_strategy(&self, name: &str, def: &StrategyDef) -> Result<(), CoordinatorError> {
        let entry = serde_json::to_string(def)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(STRATEGIES_KEY, name, entry).await?;
        Ok(())
    }

    async fn delete_strategy(&self, name: &str) -> Result<(), CoordinatorError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(STRATEGIES_KEY, name).await?;
        Ok(())
    }

    async fn strategies(&self) -> Result<HashMap<String, StrategyDef>, CoordinatorError> {
        let raw: HashMap<String, String> = with_retry(|| {
            let mut conn = self.conn.clone();
            async move { Ok(conn.hgetall(STRATEGIES_KEY).await?) }
        })
        .await?;

        let mut out = HashMap::new();
        for (name, def) in raw {
            match serde_json::from_str::<StrategyDef>(&def) {
                Ok(def) => {
                    out.insert(name, def);
                }
                Err(e) => {
                    tracing::warn!(strategy = %name, error = %e, "skipping malformed strategy entry")
                }
            }
        }
        Ok(out)
    }

    async fn register_collection(&self, tag: &IndexCollection) -> Result<(), CoordinatorError> {
        let token = tag.token();
        with_retry(|| {
            let token = token.clone();
            let mut conn = self.conn.clone();
            async move {
                let _: () = conn.sadd(COLLECTIONS_KEY, token).await?;
                Ok(())
            }
        })
        .await
    }

    async fn collections(&self) -> Result<Vec<IndexCollection>, CoordinatorError> {
        let tokens: Vec<String> = with_retry(|| {
            let mut conn = self.conn.clone();
            async move { Ok(conn.smembers(COLLECTIONS_KEY).await?) }
        })
        .await?;

        Ok(tokens
            .iter()
            .filter_map(|token| {
                let parsed = IndexCollection::parse_token(token);
                if parsed.is_none() {
                    tracing::warn!(%token, "skipping malformed collection token");
                }
                parsed
            })
            .collect())
    }
}
