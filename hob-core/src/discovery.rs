//! Heartbeat datagrams and the table of remote objects learned from them.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity;
use crate::model::Object;
use crate::protocol::{ProtocolVersion, PROTOCOL_VERSION, SERVER_VERSION};

/// Default broadcast port for heartbeats.
pub const BEAT_PORT: u16 = 52316;
/// Nominal period between heartbeats of one object.
pub const BEAT_INTERVAL: Duration = Duration::from_millis(5000);
/// Each beat loop picks its period once, uniformly within this much of the nominal one.
pub const BEAT_JITTER: Duration = Duration::from_millis(250);
const ONE_SHOT_MAX_DELAY_MS: u64 = 250;

/// Presence announcement broadcast by every local active object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    pub ip: String,
    pub vn: u32,
    pub pr: ProtocolVersion,
    pub tcs: u32,
    pub zone: String,
}

impl Heartbeat {
    pub fn for_object(object: &Object, ip: &str) -> Self {
        Self {
            id: object.id.clone(),
            ip: ip.to_string(),
            vn: identity::version_number(SERVER_VERSION),
            pr: PROTOCOL_VERSION,
            tcs: object.tcs,
            zone: object.zone.clone(),
        }
    }

    pub fn to_datagram(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Datagram asking every server to re-announce its objects once.
pub fn ping_datagram() -> Vec<u8> {
    br#"{"action":"ping"}"#.to_vec()
}

pub fn is_ping(msg: &Value) -> bool {
    msg.get("action").and_then(Value::as_str) == Some("ping")
}

/// Payload for matrix subscribers, if the datagram carries one.
pub fn matrix_payload(msg: &Value) -> Option<&Value> {
    msg.get("matrixBroadcast")
}

/// Beat period for one loop: `interval` shifted by a random amount within `jitter`.
pub fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let j = jitter.as_millis() as i64;
    let offset = if j == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-j..=j)
    };
    let ms = (interval.as_millis() as i64 + offset).max(1);
    Duration::from_millis(ms as u64)
}

/// Random delay before a one-shot heartbeat so that servers answering a ping do not collide.
pub fn one_shot_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1..=ONE_SHOT_MAX_DELAY_MS))
}

/// What discovery learned about a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownObject {
    pub ip: String,
    pub protocol: ProtocolVersion,
    pub version: u32,
}

/// Remote object id -> known object. First heartbeat wins; entries are never refreshed.
#[derive(Debug, Default)]
pub struct DiscoveryTable {
    known: BTreeMap<String, KnownObject>,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&KnownObject> {
        self.known.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnownObject)> {
        self.known.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Record `id` directly (used for hosts that learn peers out of band, and in tests).
    pub fn insert(&mut self, id: &str, entry: KnownObject) -> bool {
        if self.known.contains_key(id) {
            return false;
        }
        self.known.insert(id.to_string(), entry);
        true
    }

    /// Take note of a received datagram. Returns the id when it introduced a new object.
    /// Heartbeats without `id` or `ip`, or naming a local active object, are ignored.
    pub fn observe(&mut self, msg: &Value, is_local_active: impl Fn(&str) -> bool) -> Option<String> {
        let id = msg.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())?;
        let ip = msg.get("ip").and_then(Value::as_str).filter(|s| !s.is_empty())?;
        if is_local_active(id) || self.known.contains_key(id) {
            return None;
        }
        let protocol = msg
            .get("pr")
            .and_then(Value::as_str)
            .and_then(ProtocolVersion::parse)
            .unwrap_or(ProtocolVersion::R0);
        let version = msg
            .get("vn")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        self.known.insert(
            id.to_string(),
            KnownObject {
                ip: ip.to_string(),
                protocol,
                version,
            },
        );
        Some(id.to_string())
    }
}
