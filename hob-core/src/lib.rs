//! Hybrid object dataflow core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod bridge;
pub mod core;
pub mod discovery;
pub mod engine;
pub mod identity;
pub mod keyed;
pub mod model;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod wire;

pub use crate::core::{Hub, OutboundAction};
pub use bridge::{BridgeAction, HardwareBridge, HardwareEvent, HardwareInterfaces, NodeKey, NullBridge};
pub use discovery::{DiscoveryTable, Heartbeat, KnownObject};
pub use engine::Propagation;
pub use model::{Block, BlockLink, BlockPort, Data, DataMode, Endpoint, Frame, Link, Node, Object, Port};
pub use protocol::{ProtocolVersion, ValueMessage, PROTOCOL_VERSION};
pub use registry::{LinkStatus, Registry, RegistryError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
