//! Cluster configuration.
//!
//! Plain deserializable structs with defaults; the host hands one
//! [`ClusterConfig`] to the node at construction. Durations are carried as
//! millisecond integers with `Duration` accessors.

use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_PUB_PORT: u16 = 7511;
pub const DEFAULT_ROUTER_PORT: u16 = 7510;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub bindings: Bindings,
    pub timers: Timers,
    pub redis: RedisConfig,
    /// Development mode: a panic anywhere in the process triggers the
    /// shutdown supervisor instead of degrading silently.
    pub development: bool,
}

/// Address selectors for the two transport endpoints. Each accepts a
/// literal address, a CIDR block or an interface name, with an optional
/// `:port` suffix (see [`crate::bindings::resolve_binding`]).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Bindings {
    #[serde(rename = "pub")]
    pub pub_addr: String,
    pub router: String,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            pub_addr: format!("0.0.0.0:{DEFAULT_PUB_PORT}"),
            router: format!("0.0.0.0:{DEFAULT_ROUTER_PORT}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Timers {
    /// How long `beforeJoin` waits for replication before its single retry.
    pub join_attempt_interval_ms: u64,
    /// How long `realtime.count` waits for a missing room before failing.
    pub wait_for_missing_rooms_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A peer silent for longer than this is considered gone.
    pub heartbeat_timeout_ms: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            join_attempt_interval_ms: 2000,
            wait_for_missing_rooms_ms: 500,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15_000,
        }
    }
}

impl Timers {
    pub fn join_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.join_attempt_interval_ms)
    }

    pub fn wait_for_missing_rooms(&self) -> Duration {
        Duration::from_millis(self.wait_for_missing_rooms_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Coordinator store endpoints: one node for a single instance, several
/// for cluster mode.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub nodes: Vec<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["redis://127.0.0.1:6379".into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_field() {
        let config: ClusterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.bindings.pub_addr, "0.0.0.0:7511");
        assert_eq!(config.bindings.router, "0.0.0.0:7510");
        assert_eq!(config.timers.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(config.redis.nodes.len(), 1);
        assert!(!config.development);
    }

    #[test]
    fn partial_override_keeps_the_rest() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"bindings": {"pub": "eth0:8000"}, "timers": {"heartbeat_interval_ms": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.bindings.pub_addr, "eth0:8000");
        assert_eq!(config.bindings.router, "0.0.0.0:7510");
        assert_eq!(config.timers.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.timers.heartbeat_timeout_ms, 15_000);
    }
}
