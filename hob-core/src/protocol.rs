//! Versioned value-message protocol: R2 (current), R1 and R0 (deprecated).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{Data, DataMode, DataPatch, Endpoint, Port};

/// Server version announced in heartbeats (as `vn`, see `identity::version_number`).
pub const SERVER_VERSION: &str = "3.1.0";

/// Protocol this server speaks natively. Used in heartbeats and handshake.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::R2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[default]
    R0,
    R1,
    R2,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 3] = [ProtocolVersion::R0, ProtocolVersion::R1, ProtocolVersion::R2];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::R0 => "R0",
            ProtocolVersion::R1 => "R1",
            ProtocolVersion::R2 => "R2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    /// Single-byte form used in the connection handshake.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(i: u8) -> Option<Self> {
        Self::ALL.get(usize::from(i)).copied()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown protocol version {0:?}")]
pub struct UnknownProtocol(pub String);

/// A decoded value message. Each variant carries exactly the fields its version puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueMessage {
    R2 {
        object: String,
        frame: String,
        node: String,
        logic: Option<Port>,
        data: DataPatch,
    },
    R1 {
        object: String,
        node: String,
        data: DataPatch,
    },
    R0 {
        obj: String,
        pos: String,
        value: f64,
        mode: DataMode,
    },
}

// Raw wire shapes. Every field is optional so that presence is validated explicitly.

#[derive(Deserialize)]
struct RawR2 {
    object: Option<String>,
    frame: Option<String>,
    node: Option<String>,
    logic: Option<Value>,
    data: Option<DataPatch>,
}

#[derive(Deserialize)]
struct RawR1 {
    object: Option<String>,
    node: Option<String>,
    data: Option<DataPatch>,
}

#[derive(Deserialize)]
struct RawR0 {
    obj: Option<String>,
    pos: Option<String>,
    value: Option<f64>,
    mode: Option<String>,
}

fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

/// Only the numbers 0..=3 address a logic port; anything else (including `false`) means none.
fn logic_port(v: Option<&Value>) -> Option<Port> {
    v.and_then(Value::as_u64)
        .and_then(|n| u8::try_from(n).ok())
        .and_then(Port::new)
}

impl ValueMessage {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            ValueMessage::R2 { .. } => ProtocolVersion::R2,
            ValueMessage::R1 { .. } => ProtocolVersion::R1,
            ValueMessage::R0 { .. } => ProtocolVersion::R0,
        }
    }

    /// Destination object id.
    pub fn object(&self) -> &str {
        match self {
            ValueMessage::R2 { object, .. } | ValueMessage::R1 { object, .. } => object,
            ValueMessage::R0 { obj, .. } => obj,
        }
    }

    /// Build the message addressed to `dest` in the given protocol version.
    pub fn outbound(version: ProtocolVersion, dest: &Endpoint, data: &Data) -> Self {
        match version {
            ProtocolVersion::R2 => ValueMessage::R2 {
                object: dest.object.clone(),
                frame: dest.frame.clone(),
                node: dest.node.clone(),
                logic: dest.logic,
                data: DataPatch::from(data),
            },
            ProtocolVersion::R1 => ValueMessage::R1 {
                object: dest.object.clone(),
                node: dest.node.clone(),
                data: DataPatch::from(data),
            },
            ProtocolVersion::R0 => ValueMessage::R0 {
                obj: dest.object.clone(),
                pos: dest.node.clone(),
                value: data.value,
                mode: data.mode,
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ValueMessage::R2 {
                object,
                frame,
                node,
                logic,
                data,
            } => json!({
                "object": object,
                "frame": frame,
                "node": node,
                "logic": logic.map_or(Value::Bool(false), |p| Value::from(u8::from(p))),
                "data": data,
            }),
            ValueMessage::R1 { object, node, data } => json!({
                "object": object,
                "node": node,
                "data": data,
            }),
            ValueMessage::R0 {
                obj,
                pos,
                value,
                mode,
            } => json!({
                "obj": obj,
                "pos": pos,
                "value": value,
                "mode": mode.code(),
            }),
        }
    }

    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    /// Decode `text` as a message of `version`. Returns `None` when a required field is missing.
    pub fn decode(version: ProtocolVersion, text: &str) -> Option<Self> {
        match version {
            ProtocolVersion::R2 => {
                let raw: RawR2 = serde_json::from_str(text).ok()?;
                Some(ValueMessage::R2 {
                    object: present(raw.object)?,
                    frame: present(raw.frame)?,
                    node: present(raw.node)?,
                    logic: logic_port(raw.logic.as_ref()),
                    data: raw.data?,
                })
            }
            ProtocolVersion::R1 => {
                let raw: RawR1 = serde_json::from_str(text).ok()?;
                Some(ValueMessage::R1 {
                    object: present(raw.object)?,
                    node: present(raw.node)?,
                    data: raw.data?,
                })
            }
            ProtocolVersion::R0 => {
                let raw: RawR0 = serde_json::from_str(text).ok()?;
                Some(ValueMessage::R0 {
                    obj: present(raw.obj)?,
                    pos: present(raw.pos)?,
                    value: raw.value.unwrap_or(0.0),
                    mode: DataMode::from_code(&raw.mode?)?,
                })
            }
        }
    }

    /// Decode with `primary` first, then the oldest protocol.
    pub fn decode_with_fallback(primary: ProtocolVersion, text: &str) -> Option<Self> {
        Self::decode(primary, text).or_else(|| {
            if primary == ProtocolVersion::R0 {
                None
            } else {
                Self::decode(ProtocolVersion::R0, text)
            }
        })
    }
}
