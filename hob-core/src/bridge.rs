//! Hardware bridge: the callbacks the core makes into the host, and the listener tables
//! hardware interfaces register with the core.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{Data, Link, Object, Port};

/// Host side of the bridge. Every method defaults to a no-op.
pub trait HardwareBridge: Send {
    /// A node value changed because of propagation.
    fn data(&mut self, _object: &str, _frame: &str, _node: &str, _data: &Data) {}
    /// A node's public data changed.
    fn public_data(&mut self, _object: &str, _frame: &str, _node: &str, _public: &Map<String, Value>) {}
    /// Editor-facing action (reload requests, connection adverts).
    fn actions(&mut self, _action: &BridgeAction) {}
    /// The object should be written to persistent storage.
    fn write(&mut self, _object: &Object) {}
}

/// Bridge that ignores everything.
pub struct NullBridge;

impl HardwareBridge for NullBridge {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeAction {
    ReloadObject {
        object: String,
    },
    ReloadNode {
        object: String,
        frame: String,
        node: String,
    },
    ReloadLink {
        object: String,
        frame: String,
    },
    AdvertiseConnection {
        object: String,
        frame: String,
        node: String,
        logic: Option<Port>,
    },
}

/// Identity of a node as seen by hardware listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub object: String,
    pub frame: String,
    pub node: String,
}

impl NodeKey {
    pub fn new(object: &str, frame: &str, node: &str) -> Self {
        Self {
            object: object.to_string(),
            frame: frame.to_string(),
            node: node.to_string(),
        }
    }
}

/// Link added to or removed from the graph, as passed to connection listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub link: Link,
    pub added: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareEvent {
    Initialize,
    Reset,
    Shutdown,
}

pub type ReadListener = Box<dyn FnMut(&Data) + Send>;
pub type PublicDataListener = Box<dyn FnMut(&Map<String, Value>) + Send>;
pub type ConnectionListener = Box<dyn FnMut(&LinkEvent) + Send>;
pub type MessageListener = Box<dyn FnMut(&Value) + Send>;
pub type Hook = Box<dyn FnMut() + Send>;

/// Listener tables. One read / public-data / connection listener per node; a later
/// registration replaces the earlier one.
#[derive(Default)]
pub struct HardwareInterfaces {
    read: HashMap<NodeKey, ReadListener>,
    public_data: HashMap<NodeKey, PublicDataListener>,
    connection: HashMap<NodeKey, ConnectionListener>,
    matrix: Vec<MessageListener>,
    udp: Vec<MessageListener>,
    hooks: HashMap<HardwareEvent, Vec<Hook>>,
    /// Node ids each object's interface declared, by object id.
    declared: HashMap<String, HashSet<String>>,
}

impl HardwareInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read_listener(&mut self, key: NodeKey, listener: impl FnMut(&Data) + Send + 'static) {
        self.read.insert(key, Box::new(listener));
    }

    /// Hand a node value to its read listener. Returns whether one was registered.
    pub fn read_call(&mut self, object: &str, frame: &str, node: &str, data: &Data) -> bool {
        match self.read.get_mut(&NodeKey::new(object, frame, node)) {
            Some(l) => {
                l(data);
                true
            }
            None => false,
        }
    }

    pub fn add_public_data_listener(
        &mut self,
        key: NodeKey,
        listener: impl FnMut(&Map<String, Value>) + Send + 'static,
    ) {
        self.public_data.insert(key, Box::new(listener));
    }

    pub fn read_public_data_call(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        public: &Map<String, Value>,
    ) -> bool {
        match self.public_data.get_mut(&NodeKey::new(object, frame, node)) {
            Some(l) => {
                l(public);
                true
            }
            None => false,
        }
    }

    pub fn add_connection_listener(
        &mut self,
        key: NodeKey,
        listener: impl FnMut(&LinkEvent) + Send + 'static,
    ) {
        self.connection.insert(key, Box::new(listener));
    }

    /// Notify both endpoints of a link about its creation or removal.
    pub fn connect_call(&mut self, event: &LinkEvent) {
        for e in [&event.link.source, &event.link.destination] {
            if let Some(l) = self.connection.get_mut(&NodeKey::new(&e.object, &e.frame, &e.node)) {
                l(event);
            }
        }
    }

    /// Drop every node listener and declaration registered for `object`.
    pub fn remove_read_listeners(&mut self, object: &str) {
        self.read.retain(|k, _| k.object != object);
        self.public_data.retain(|k, _| k.object != object);
        self.connection.retain(|k, _| k.object != object);
        self.declared.remove(object);
    }

    pub fn declare_node(&mut self, object: &str, node: &str) {
        self.declared
            .entry(object.to_string())
            .or_default()
            .insert(node.to_string());
    }

    pub fn is_declared(&self, object: &str, node: &str) -> bool {
        self.declared.get(object).is_some_and(|d| d.contains(node))
    }

    pub fn add_matrix_listener(&mut self, listener: impl FnMut(&Value) + Send + 'static) {
        self.matrix.push(Box::new(listener));
    }

    pub fn trigger_matrix_callbacks(&mut self, msg: &Value) {
        for l in &mut self.matrix {
            l(msg);
        }
    }

    pub fn add_udp_listener(&mut self, listener: impl FnMut(&Value) + Send + 'static) {
        self.udp.push(Box::new(listener));
    }

    pub fn trigger_udp_callbacks(&mut self, msg: &Value) {
        for l in &mut self.udp {
            l(msg);
        }
    }

    pub fn add_event_listener(&mut self, event: HardwareEvent, hook: impl FnMut() + Send + 'static) {
        self.hooks.entry(event).or_default().push(Box::new(hook));
    }

    /// Run the hooks registered for `event`, in registration order.
    pub fn emit(&mut self, event: HardwareEvent) {
        if let Some(hooks) = self.hooks.get_mut(&event) {
            for h in hooks.iter_mut() {
                h();
            }
        }
    }
}

/// Linear map of `x` from one range to another, clamping to the input range first.
pub fn map_range(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    if in_max == in_min {
        return out_min;
    }
    let x = x.clamp(in_min.min(in_max), in_min.max(in_max));
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}
