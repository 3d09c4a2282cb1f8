//! Wire topics and sync payloads exchanged between nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topics framed on the node-to-node fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Heartbeat,
    Sync,
    NotifyDocument,
    NotifyUser,
    AdminResetSecurity,
    AdminDump,
    AdminShutdown,
    Ready,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Heartbeat => "cluster:heartbeat",
            Topic::Sync => "cluster:sync",
            Topic::NotifyDocument => "cluster:notify:document",
            Topic::NotifyUser => "cluster:notify:user",
            Topic::AdminResetSecurity => "cluster:admin:resetSecurity",
            Topic::AdminDump => "cluster:admin:dump",
            Topic::AdminShutdown => "cluster:admin:shutdown",
            Topic::Ready => "cluster:ready",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cluster:heartbeat" => Some(Topic::Heartbeat),
            "cluster:sync" => Some(Topic::Sync),
            "cluster:notify:document" => Some(Topic::NotifyDocument),
            "cluster:notify:user" => Some(Topic::NotifyUser),
            "cluster:admin:resetSecurity" => Some(Topic::AdminResetSecurity),
            "cluster:admin:dump" => Some(Topic::AdminDump),
            "cluster:admin:shutdown" => Some(Topic::AdminShutdown),
            "cluster:ready" => Some(Topic::Ready),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `cluster:sync` frame, discriminated by its `event` field.
///
/// Decoding fails on event names this node does not know; the sync engine
/// logs those frames and drops them, so newer nodes can introduce events
/// without breaking older ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// One `(index, collection)` changed; peers re-pull its authoritative
    /// state through `getState`.
    #[serde(rename = "state")]
    State {
        index: String,
        collection: String,
        /// What triggered the broadcast: `add`, `join` or `off`.
        post: String,
    },
    /// Every known tag must be re-pulled.
    #[serde(rename = "state:all")]
    StateAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post: Option<String>,
    },
    #[serde(rename = "indexCache:add")]
    IndexCacheAdd {
        index: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
    },
    #[serde(rename = "indexCache:remove")]
    IndexCacheRemove {
        index: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
    },
    /// A profile changed; peers must invalidate their cached copy.
    #[serde(rename = "profile")]
    Profile { id: String },
    /// A role changed; peers must invalidate their cached copy.
    #[serde(rename = "role")]
    Role { id: String },
    /// Validation specifications changed; peers reload the whole cache.
    #[serde(rename = "validators")]
    Validators,
    /// The strategy hash changed; peers diff it against their registry.
    #[serde(rename = "strategies")]
    Strategies,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_round_trip() {
        for topic in [
            Topic::Heartbeat,
            Topic::Sync,
            Topic::NotifyDocument,
            Topic::NotifyUser,
            Topic::AdminResetSecurity,
            Topic::AdminDump,
            Topic::AdminShutdown,
            Topic::Ready,
        ] {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("cluster:nope"), None);
    }

    #[test]
    fn sync_event_is_tagged_by_event_field() {
        let ev = SyncEvent::State {
            index: "idx".into(),
            collection: "col".into(),
            post: "add".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "state");
        assert_eq!(serde_json::from_value::<SyncEvent>(json).unwrap(), ev);
    }

    #[test]
    fn unit_events_carry_only_the_tag() {
        let json = serde_json::to_value(SyncEvent::Validators).unwrap();
        assert_eq!(json, json!({"event": "validators"}));
    }

    #[test]
    fn unknown_event_fails_decoding() {
        let res = serde_json::from_value::<SyncEvent>(json!({"event": "state:v2"}));
        assert!(res.is_err());
    }
}
