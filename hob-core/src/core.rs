//! Host-driven API: the Hub receives events from the host and returns actions.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeAction, HardwareBridge, HardwareEvent, HardwareInterfaces, LinkEvent, NodeKey, NullBridge};
use crate::discovery::{self, DiscoveryTable, Heartbeat};
use crate::engine::{Engine, Propagation};
use crate::identity;
use crate::model::{Data, Frame, Link, Node, Object, Port};
use crate::pool::{self, Reconciliation};
use crate::protocol::{ProtocolVersion, ValueMessage, PROTOCOL_VERSION};
use crate::registry::{LinkStatus, Registry, RegistryError};
use crate::render::Renderers;
use crate::wire;

/// Work the host must carry out on behalf of the core.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Write a framed value message to the pooled connection for `address`.
    Send { address: String, frame: Vec<u8> },
    /// Broadcast a heartbeat for `object` once, after `delay`.
    Announce {
        object: String,
        datagram: Vec<u8>,
        delay: Duration,
    },
}

/// Single state container: registry, discovery table, renderers and hardware bridge.
pub struct Hub {
    registry: Registry,
    known: DiscoveryTable,
    renderers: Renderers,
    hardware: HardwareInterfaces,
    bridge: Box<dyn HardwareBridge>,
    protocol: ProtocolVersion,
    ip: String,
    last: Propagation,
}

impl Hub {
    pub fn new(ip: &str) -> Self {
        Self::with_bridge(ip, Box::new(NullBridge))
    }

    pub fn with_bridge(ip: &str, bridge: Box<dyn HardwareBridge>) -> Self {
        Self {
            registry: Registry::new(),
            known: DiscoveryTable::new(),
            renderers: Renderers::default(),
            hardware: HardwareInterfaces::new(),
            bridge,
            protocol: PROTOCOL_VERSION,
            ip: ip.to_string(),
            last: Propagation::default(),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Direct registry access for authoring that needs no bridge notifications.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn known(&self) -> &DiscoveryTable {
        &self.known
    }

    pub fn known_mut(&mut self) -> &mut DiscoveryTable {
        &mut self.known
    }

    pub fn renderers_mut(&mut self) -> &mut Renderers {
        &mut self.renderers
    }

    pub fn hardware_mut(&mut self) -> &mut HardwareInterfaces {
        &mut self.hardware
    }

    /// Report of the most recent propagation chain.
    pub fn last_propagation(&self) -> &Propagation {
        &self.last
    }

    fn engine(&mut self) -> Engine<'_> {
        Engine::new(
            &mut self.registry,
            &self.known,
            &self.renderers,
            &mut self.hardware,
            self.bridge.as_mut(),
        )
    }

    fn finish(&mut self, report: Propagation) -> Vec<OutboundAction> {
        if report.cut_edges > 0 {
            warn!(cut = report.cut_edges, "propagation cut at cycles");
        }
        let actions = report
            .remote
            .iter()
            .filter_map(|send| match wire::encode_frame(&send.message.encode()) {
                Ok(frame) => Some(OutboundAction::Send {
                    address: send.address.clone(),
                    frame,
                }),
                Err(e) => {
                    warn!(address = %send.address, object = %send.object, "cannot frame message: {e}");
                    None
                }
            })
            .collect();
        self.last = report;
        actions
    }

    /// Re-render a node and propagate its value.
    pub fn trigger(&mut self, object: &str, frame: &str, node: &str) -> Vec<OutboundAction> {
        let mut engine = self.engine();
        engine.trigger(object, frame, node);
        let report = engine.finish();
        self.finish(report)
    }

    /// A hardware interface produced a value for one of its nodes.
    pub fn hardware_write(&mut self, object: &str, frame: &str, node: &str, data: &Data) -> Vec<OutboundAction> {
        let mut engine = self.engine();
        if !engine.hardware_write(object, frame, node, data) {
            debug!(object, frame, node, "hardware write to unknown node");
        }
        let report = engine.finish();
        self.finish(report)
    }

    /// Inbound value message, decoded with this server's protocol first.
    pub fn on_value_message(&mut self, text: &str) -> Option<Vec<OutboundAction>> {
        self.on_value_message_with(self.protocol, text)
    }

    /// Inbound value message, decoded with `primary` first and R0 as fallback.
    /// Returns `None` for messages that decode under neither.
    pub fn on_value_message_with(&mut self, primary: ProtocolVersion, text: &str) -> Option<Vec<OutboundAction>> {
        let Some(msg) = ValueMessage::decode_with_fallback(primary, text) else {
            debug!(len = text.len(), "dropping malformed value message");
            return None;
        };
        let mut engine = self.engine();
        if !engine.apply(&msg) {
            debug!(object = msg.object(), "value message for unknown destination");
        }
        let report = engine.finish();
        Some(self.finish(report))
    }

    /// Handle a datagram received on the broadcast port.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Vec<OutboundAction> {
        let msg: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                debug!("ignoring non-json datagram: {e}");
                return Vec::new();
            }
        };
        let registry = &self.registry;
        if let Some(id) = self.known.observe(&msg, |id| registry.is_active(id)) {
            if let Some(k) = self.known.get(&id) {
                info!(id = %id, ip = %k.ip, protocol = %k.protocol, "found new object");
            }
        }

        let mut actions = Vec::new();
        if discovery::is_ping(&msg) {
            debug!("ping received; announcing local objects");
            actions = self.announce_all();
        }
        match discovery::matrix_payload(&msg) {
            Some(m) => self.hardware.trigger_matrix_callbacks(m),
            None => self.hardware.trigger_udp_callbacks(&msg),
        }
        actions
    }

    /// One-shot announcements for every local active object, each after its own random delay.
    pub fn announce_all(&self) -> Vec<OutboundAction> {
        self.local_object_ids()
            .into_iter()
            .filter_map(|id| {
                let hb = self.heartbeat(&id)?;
                Some(OutboundAction::Announce {
                    object: id,
                    datagram: hb.to_datagram(),
                    delay: discovery::one_shot_delay(),
                })
            })
            .collect()
    }

    /// Heartbeat for a local object, or `None` when it is gone or deactivated.
    pub fn heartbeat(&self, object: &str) -> Option<Heartbeat> {
        if !self.registry.is_active(object) {
            return None;
        }
        let o = self.registry.object(object)?;
        Some(Heartbeat::for_object(o, &self.ip))
    }

    /// Ids of local objects that announce themselves.
    pub fn local_object_ids(&self) -> Vec<String> {
        self.registry
            .objects()
            .filter(|o| !o.deactivated)
            .map(|o| o.id.clone())
            .collect()
    }

    /// Plan connections for the current link graph given the addresses already open.
    pub fn reconcile(&self, open: &BTreeSet<String>) -> Reconciliation {
        pool::reconcile(&self.registry, &self.known, open)
    }

    /// Insert an object loaded from storage, with this server's address.
    pub fn load_object(&mut self, mut object: Object) -> Result<(), RegistryError> {
        object.ip = self.ip.clone();
        self.registry.add_object(object)
    }

    /// Create an object and ask the bridge to persist it.
    pub fn add_object(&mut self, object: Object) -> Result<(), RegistryError> {
        let id = object.id.clone();
        self.registry.add_object(object)?;
        self.write(&id);
        Ok(())
    }

    pub fn remove_object(&mut self, object: &str) -> Result<Object, RegistryError> {
        let removed = self.registry.remove_object(object)?;
        self.hardware.remove_read_listeners(object);
        Ok(removed)
    }

    pub fn set_deactivated(&mut self, object: &str, deactivated: bool) -> Result<(), RegistryError> {
        self.registry.set_deactivated(object, deactivated)?;
        self.write(object);
        Ok(())
    }

    /// Add a link. Non-loop links notify connection listeners, ask editors to reload and persist.
    pub fn add_link(&mut self, link: Link) -> Result<(String, LinkStatus), RegistryError> {
        let (object, frame) = (link.source.object.clone(), link.source.frame.clone());
        let event = LinkEvent {
            link: link.clone(),
            added: true,
        };
        let (id, status) = self.registry.add_link(link)?;
        match status {
            LinkStatus::Added => {
                info!(link = %id, "added link");
                self.hardware.connect_call(&event);
                self.bridge.actions(&BridgeAction::ReloadLink {
                    object: object.clone(),
                    frame,
                });
                self.write(&object);
            }
            LinkStatus::Loop => warn!(link = %id, "link is a loop; it will not propagate"),
        }
        Ok((id, status))
    }

    pub fn remove_link(&mut self, object: &str, frame: &str, link: &str) -> Result<Link, RegistryError> {
        let removed = self.registry.remove_link(object, frame, link)?;
        info!(link, "removed link");
        self.hardware.connect_call(&LinkEvent {
            link: removed.clone(),
            added: false,
        });
        self.bridge.actions(&BridgeAction::ReloadLink {
            object: object.to_string(),
            frame: frame.to_string(),
        });
        self.write(object);
        Ok(removed)
    }

    /// Replace a node's public data and notify listeners and the bridge.
    pub fn set_public_data(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        public: Map<String, Value>,
    ) -> Result<(), RegistryError> {
        let n = self
            .registry
            .node_mut(object, frame, node)
            .ok_or_else(|| RegistryError::NotFound(node.to_string()))?;
        n.public_data = public;
        let public = n.public_data.clone();
        self.hardware.read_public_data_call(object, frame, node, &public);
        self.bridge.public_data(object, frame, node, &public);
        Ok(())
    }

    /// Tell editors that a hardware node is ready to be linked.
    pub fn advertise_connection(&mut self, object: &str, frame: &str, node: &str, logic: Option<Port>) {
        self.bridge.actions(&BridgeAction::AdvertiseConnection {
            object: object.to_string(),
            frame: frame.to_string(),
            node: node.to_string(),
            logic,
        });
    }

    /// Id of the local object named `name`.
    pub fn object_id(&self, name: &str) -> Option<String> {
        self.registry.object_id_by_name(name).map(str::to_string)
    }

    /// Frame and node ids a hardware node named `node_name` has on object `object`.
    fn hardware_ids(object: &str, object_name: &str, node_name: &str) -> (String, String) {
        let frame = identity::frame_id(object, object_name);
        let node = identity::node_id(&frame, node_name);
        (frame, node)
    }

    /// Declare a hardware node. The object and its hardware frame (named after the object)
    /// are created on first use; an existing node keeps its value and links and takes `kind`.
    pub fn hardware_add_node(
        &mut self,
        object_name: &str,
        node_name: &str,
        kind: &str,
    ) -> Result<NodeKey, RegistryError> {
        let object = match self.object_id(object_name) {
            Some(id) => id,
            None => {
                let o = Object::new(object_name, &self.ip);
                let id = o.id.clone();
                self.registry.add_object(o)?;
                info!(object = %id, "created object for hardware interface");
                id
            }
        };
        let (frame, node) = Self::hardware_ids(&object, object_name, node_name);
        if self.registry.frame(&object, &frame).is_none() {
            self.registry.add_frame(&object, Frame::new(object_name))?;
        }
        match self.registry.node_mut(&object, &frame, &node) {
            Some(n) => {
                n.name = node_name.to_string();
                n.renderer = kind.to_string();
            }
            None => {
                self.registry
                    .add_node(&object, &frame, Node::with_renderer(node_name, kind))?;
                debug!(object = %object, node = %node, "added hardware node");
            }
        }
        self.hardware.declare_node(&object, &node);
        self.write(&object);
        Ok(NodeKey::new(&object, &frame, &node))
    }

    /// `hardware_write` addressed by object and node name.
    pub fn hardware_write_named(&mut self, object_name: &str, node_name: &str, data: &Data) -> Vec<OutboundAction> {
        let Some(object) = self.object_id(object_name) else {
            debug!(object_name, "hardware write to unknown object");
            return Vec::new();
        };
        let (frame, node) = Self::hardware_ids(&object, object_name, node_name);
        self.hardware_write(&object, &frame, &node, data)
    }

    /// Drop the hardware frame's nodes that the interface did not declare, with their links.
    /// Returns the removed node ids.
    pub fn clear_object(&mut self, object_name: &str) -> Result<Vec<String>, RegistryError> {
        let object = self
            .object_id(object_name)
            .ok_or_else(|| RegistryError::NotFound(object_name.to_string()))?;
        let frame = identity::frame_id(&object, object_name);
        let stale: Vec<String> = match self.registry.frame(&object, &frame) {
            Some(f) => f
                .nodes
                .keys()
                .filter(|n| !self.hardware.is_declared(&object, n))
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        for node in &stale {
            self.registry.remove_node(&object, &frame, node)?;
            info!(object = %object, node = %node, "removed undeclared node");
        }
        if !stale.is_empty() {
            self.bridge.actions(&BridgeAction::ReloadObject { object: object.clone() });
            self.write(&object);
        }
        Ok(stale)
    }

    pub fn activate(&mut self, object_name: &str) -> Result<(), RegistryError> {
        self.set_deactivated_named(object_name, false)
    }

    pub fn deactivate(&mut self, object_name: &str) -> Result<(), RegistryError> {
        self.set_deactivated_named(object_name, true)
    }

    fn set_deactivated_named(&mut self, object_name: &str, deactivated: bool) -> Result<(), RegistryError> {
        let object = self
            .object_id(object_name)
            .ok_or_else(|| RegistryError::NotFound(object_name.to_string()))?;
        self.set_deactivated(&object, deactivated)
    }

    fn write(&mut self, object: &str) {
        if let Some(o) = self.registry.object(object) {
            self.bridge.write(o);
        }
    }

    pub fn initialize(&mut self) {
        info!(objects = self.registry.objects().count(), "initializing hardware interfaces");
        self.hardware.emit(HardwareEvent::Initialize);
    }

    pub fn reset(&mut self) {
        info!("resetting hardware interfaces");
        self.hardware.emit(HardwareEvent::Reset);
        for id in self.registry.object_ids().map(str::to_string).collect::<Vec<_>>() {
            self.bridge.actions(&BridgeAction::ReloadObject { object: id });
        }
    }

    pub fn shutdown(&mut self) {
        info!("shutting down hardware interfaces");
        self.hardware.emit(HardwareEvent::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::bridge::NodeKey;
    use crate::discovery::KnownObject;
    use crate::model::{Block, BlockLink, BlockPort, DataPatch, Endpoint, Frame, Node, PORTS};
    use crate::render::BlockRenderer;

    fn hub_with(objects: &[&str]) -> Hub {
        let mut hub = Hub::new("127.0.0.1");
        for id in objects {
            hub.load_object(Object::with_id(id, id, "")).unwrap();
            hub.registry_mut().add_frame(id, Frame::new("f")).unwrap();
        }
        hub
    }

    fn frame_of(id: &str) -> String {
        crate::identity::frame_id(id, "f")
    }

    fn learn(hub: &mut Hub, id: &str, ip: &str, pr: &str) {
        let hb = format!(r#"{{"id":"{id}","ip":"{ip}","vn":310,"pr":"{pr}"}}"#);
        hub.on_datagram(hb.as_bytes());
    }

    fn sent(actions: &[OutboundAction]) -> Vec<(String, ValueMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send { address, frame } => {
                    let (text, _) = wire::decode_frame(frame).unwrap();
                    Some((address.clone(), ValueMessage::decode(ProtocolVersion::R2, &text)?))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scenario_local_link() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let n1 = hub.registry_mut().add_node("A1", &f, Node::new("N1")).unwrap();
        let n2 = hub.registry_mut().add_node("A1", &f, Node::new("N2")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &f, &n1), Endpoint::node("A1", &f, &n2)))
            .unwrap();

        let actions = hub.hardware_write("A1", &f, &n1, &Data::with_value(0.7));
        assert!(actions.is_empty());
        assert_eq!(hub.registry().node("A1", &f, &n2).unwrap().data.value, 0.7);
        assert_eq!(hub.last_propagation().local_deliveries, 1);
    }

    #[test]
    fn scenario_remote_link() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let n1 = hub.registry_mut().add_node("A1", &f, Node::new("N1")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &f, &n1), Endpoint::node("B2", "B2f", "B2fN2")))
            .unwrap();
        learn(&mut hub, "B2", "10.0.0.5", "R2");

        let actions = hub.hardware_write("A1", &f, &n1, &Data::with_value(0.7));
        let sends = sent(&actions);
        assert_eq!(sends.len(), 1);
        let (address, msg) = &sends[0];
        assert_eq!(address, "10.0.0.5");
        match msg {
            ValueMessage::R2 { object, node, logic, data, .. } => {
                assert_eq!(object, "B2");
                assert_eq!(node, "B2fN2");
                assert_eq!(*logic, None);
                assert_eq!(data.value, Some(0.7));
            }
            other => panic!("expected R2, got {other:?}"),
        }
    }

    struct Half;

    impl BlockRenderer for Half {
        fn render(&self, block: &mut Block, index: Port) -> [Option<Data>; PORTS] {
            let mut out: [Option<Data>; PORTS] = Default::default();
            let mut d = block.data[index.index()].clone();
            d.value /= 2.0;
            out[0] = Some(d);
            out
        }
    }

    #[test]
    fn scenario_logic_node_to_remote() {
        let mut hub = hub_with(&["A1"]);
        hub.renderers_mut().register_block("half", Half);
        let f = frame_of("A1");
        let logic = hub.registry_mut().add_logic_node("A1", &f, "L").unwrap();
        let reg = hub.registry_mut();
        reg.add_block("A1", &f, &logic, "half", Block::new("half", "half")).unwrap();
        for (id, (a, b)) in [("b1", ("in2", "half")), ("b2", ("half", "out0"))] {
            reg.add_block_link(
                "A1",
                &f,
                &logic,
                id,
                BlockLink::new(BlockPort::new(a, Port::ALL[0]), BlockPort::new(b, Port::ALL[0])),
            )
            .unwrap();
        }
        hub.add_link(Link::new(
            Endpoint::port("A1", &f, &logic, Port::ALL[0]),
            Endpoint::port("C3", "C3f", "C3fL", Port::ALL[0]),
        ))
        .unwrap();
        learn(&mut hub, "C3", "10.0.0.7", "R2");

        let inbound = ValueMessage::R2 {
            object: "A1".into(),
            frame: f.clone(),
            node: logic.clone(),
            logic: Port::new(2),
            data: DataPatch::from(&Data::with_value(1.0)),
        };
        let actions = hub.on_value_message(&inbound.encode()).unwrap();
        let sends = sent(&actions);
        assert_eq!(sends.len(), 1);
        match &sends[0].1 {
            ValueMessage::R2 { object, logic, data, .. } => {
                assert_eq!(object, "C3");
                assert_eq!(*logic, Port::new(0));
                assert_eq!(data.value, Some(0.5));
            }
            other => panic!("expected R2, got {other:?}"),
        }
        let node = hub.registry().node("A1", &f, &logic).unwrap();
        assert_eq!(node.logic_state().unwrap().route_buffer, [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn fan_out_reaches_every_destination() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let src = hub.registry_mut().add_node("A1", &f, Node::new("src")).unwrap();
        let mut locals = Vec::new();
        for name in ["x", "y", "z"] {
            let id = hub.registry_mut().add_node("A1", &f, Node::new(name)).unwrap();
            hub.add_link(Link::new(Endpoint::node("A1", &f, &src), Endpoint::node("A1", &f, &id)))
                .unwrap();
            locals.push(id);
        }
        for remote in ["B2", "D4"] {
            hub.add_link(Link::new(Endpoint::node("A1", &f, &src), Endpoint::node(remote, "g", "n")))
                .unwrap();
        }
        learn(&mut hub, "B2", "10.0.0.5", "R2");
        learn(&mut hub, "D4", "10.0.0.5", "R2");

        let actions = hub.hardware_write("A1", &f, &src, &Data::with_value(0.3));
        assert_eq!(sent(&actions).len(), 2);
        for id in &locals {
            assert_eq!(hub.registry().node("A1", &f, id).unwrap().data.value, 0.3);
        }
        let report = hub.last_propagation();
        assert_eq!(report.triggers, 1 + locals.len());
        assert_eq!(report.local_deliveries, locals.len());
        assert_eq!(report.remote.len(), 2);
        let plan = hub.reconcile(&BTreeSet::new());
        assert_eq!(plan.to_open, vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn deactivated_object_stores_but_does_not_propagate() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let a = hub.registry_mut().add_node("A1", &f, Node::new("a")).unwrap();
        let b = hub.registry_mut().add_node("A1", &f, Node::new("b")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &f, &a), Endpoint::node("A1", &f, &b)))
            .unwrap();
        hub.set_deactivated("A1", true).unwrap();

        let text = format!(r#"{{"object":"A1","frame":"{f}","node":"{a}","data":{{"value":0.8}}}}"#);
        assert!(hub.on_value_message(&text).unwrap().is_empty());
        assert_eq!(hub.registry().node("A1", &f, &a).unwrap().data.value, 0.8);
        assert_eq!(hub.registry().node("A1", &f, &b).unwrap().data.value, 0.0);
        assert_eq!(hub.last_propagation().triggers, 0);
    }

    #[test]
    fn deactivated_logic_node_does_not_run_blocks() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let logic = hub.registry_mut().add_logic_node("A1", &f, "L").unwrap();
        hub.registry_mut()
            .add_block_link(
                "A1",
                &f,
                &logic,
                "through",
                BlockLink::new(BlockPort::new("in1", Port::ALL[0]), BlockPort::new("out1", Port::ALL[0])),
            )
            .unwrap();
        hub.add_link(Link::new(
            Endpoint::port("A1", &f, &logic, Port::ALL[1]),
            Endpoint::port("C3", "C3f", "C3fL", Port::ALL[0]),
        ))
        .unwrap();
        learn(&mut hub, "C3", "10.0.0.7", "R2");
        let text = format!(
            r#"{{"object":"A1","frame":"{f}","node":"{logic}","logic":1,"data":{{"value":0.6}}}}"#
        );

        hub.set_deactivated("A1", true).unwrap();
        assert!(hub.on_value_message(&text).unwrap().is_empty());
        assert_eq!(hub.last_propagation().block_triggers, 0);
        let node = hub.registry().node("A1", &f, &logic).unwrap();
        assert_eq!(node.logic_state().unwrap().route_buffer, [0.0, 0.6, 0.0, 0.0]);

        hub.set_deactivated("A1", false).unwrap();
        let sends = sent(&hub.on_value_message(&text).unwrap());
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "10.0.0.7");
    }

    #[test]
    fn hardware_node_is_created_then_updated_by_name() {
        let mut hub = Hub::new("10.0.0.2");
        let key = hub.hardware_add_node("lamp", "switch", "node").unwrap();
        let object = hub.object_id("lamp").unwrap();
        assert_eq!(key.object, object);
        assert_eq!(hub.registry().object(&object).unwrap().ip, "10.0.0.2");
        assert_eq!(key.frame, crate::identity::frame_id(&object, "lamp"));

        hub.hardware_write_named("lamp", "switch", &Data::with_value(1.0));
        let again = hub.hardware_add_node("lamp", "switch", "slider").unwrap();
        assert_eq!(again, key);
        let n = hub.registry().node(&key.object, &key.frame, &key.node).unwrap();
        assert_eq!(n.renderer, "slider");
        assert_eq!(n.data.value, 1.0);
        assert_eq!(hub.registry().objects().count(), 1);
        assert!(hub.object_id("fan").is_none());
    }

    #[test]
    fn hardware_write_by_name_propagates() {
        let mut hub = Hub::new("10.0.0.2");
        let src = hub.hardware_add_node("lamp", "dimmer", "node").unwrap();
        let dst = hub.hardware_add_node("lamp", "bulb", "node").unwrap();
        hub.add_link(Link::new(
            Endpoint::node(&src.object, &src.frame, &src.node),
            Endpoint::node(&dst.object, &dst.frame, &dst.node),
        ))
        .unwrap();
        assert!(hub.hardware_write_named("lamp", "dimmer", &Data::with_value(0.4)).is_empty());
        assert_eq!(hub.registry().node(&dst.object, &dst.frame, &dst.node).unwrap().data.value, 0.4);
        assert!(hub.hardware_write_named("nobody", "dimmer", &Data::with_value(0.4)).is_empty());
    }

    #[test]
    fn clear_object_drops_undeclared_nodes_and_links() {
        let mut hub = Hub::new("10.0.0.2");
        let keep = hub.hardware_add_node("lamp", "switch", "node").unwrap();
        let (object, frame) = (keep.object.clone(), keep.frame.clone());
        let stale = hub
            .registry_mut()
            .add_node(&object, &frame, Node::new("old"))
            .unwrap();
        hub.add_link(Link::new(
            Endpoint::node(&object, &frame, &keep.node),
            Endpoint::node(&object, &frame, &stale),
        ))
        .unwrap();

        assert_eq!(hub.clear_object("lamp").unwrap(), vec![stale.clone()]);
        assert!(hub.registry().node(&object, &frame, &stale).is_none());
        assert!(hub.registry().node(&object, &frame, &keep.node).is_some());
        assert_eq!(hub.registry().links().count(), 0);
        assert!(hub.clear_object("lamp").unwrap().is_empty());
        assert!(matches!(hub.clear_object("fan"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn activate_and_deactivate_by_name() {
        let mut hub = Hub::new("10.0.0.2");
        let key = hub.hardware_add_node("lamp", "switch", "node").unwrap();
        hub.deactivate("lamp").unwrap();
        assert!(hub.heartbeat(&key.object).is_none());
        assert!(hub.local_object_ids().is_empty());
        hub.activate("lamp").unwrap();
        assert!(hub.heartbeat(&key.object).is_some());
        assert!(matches!(hub.deactivate("fan"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn self_link_never_propagates() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let n = hub.registry_mut().add_node("A1", &f, Node::new("N")).unwrap();
        let e = Endpoint::node("A1", &f, &n);
        let (_, status) = hub.add_link(Link::new(e.clone(), e)).unwrap();
        assert_eq!(status, LinkStatus::Loop);
        hub.hardware_write("A1", &f, &n, &Data::with_value(1.0));
        assert_eq!(hub.last_propagation().triggers, 1);
        assert_eq!(hub.last_propagation().local_deliveries, 0);
    }

    #[test]
    fn two_hop_cycle_is_cut() {
        let mut hub = hub_with(&["A1", "B2"]);
        let (fa, fb) = (frame_of("A1"), frame_of("B2"));
        let a = hub.registry_mut().add_node("A1", &fa, Node::new("a")).unwrap();
        let b = hub.registry_mut().add_node("B2", &fb, Node::new("b")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &fa, &a), Endpoint::node("B2", &fb, &b)))
            .unwrap();
        hub.add_link(Link::new(Endpoint::node("B2", &fb, &b), Endpoint::node("A1", &fa, &a)))
            .unwrap();
        hub.hardware_write("A1", &fa, &a, &Data::with_value(0.4));
        let report = hub.last_propagation();
        assert_eq!(report.cut_edges, 1);
        assert_eq!(hub.registry().node("B2", &fb, &b).unwrap().data.value, 0.4);
    }

    #[test]
    fn route_buffer_ports_are_isolated() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let logic = hub.registry_mut().add_logic_node("A1", &f, "L").unwrap();
        for (port, value) in [(3u8, 0.3), (0, 0.1), (3, 0.9), (1, 0.5), (0, 0.2)] {
            let text = format!(
                r#"{{"object":"A1","frame":"{f}","node":"{logic}","logic":{port},"data":{{"value":{value}}}}}"#
            );
            hub.on_value_message(&text).unwrap();
        }
        let node = hub.registry().node("A1", &f, &logic).unwrap();
        assert_eq!(node.logic_state().unwrap().route_buffer, [0.2, 0.5, 0.0, 0.9]);
    }

    #[test]
    fn malformed_message_is_dropped() {
        let mut hub = hub_with(&["A1"]);
        assert!(hub.on_value_message(r#"{"object":"A1"}"#).is_none());
        assert!(hub.on_value_message("garbage").is_none());
    }

    #[test]
    fn discovery_first_heartbeat_wins_and_skips_local() {
        let mut hub = hub_with(&["A1"]);
        learn(&mut hub, "B2", "10.0.0.5", "R2");
        learn(&mut hub, "B2", "10.0.0.6", "R1");
        learn(&mut hub, "A1", "10.0.0.8", "R2");
        assert_eq!(
            hub.known().get("B2"),
            Some(&KnownObject {
                ip: "10.0.0.5".into(),
                protocol: ProtocolVersion::R2,
                version: 310,
            })
        );
        assert!(hub.known().get("A1").is_none());
    }

    #[test]
    fn ping_announces_active_objects_once() {
        let mut hub = hub_with(&["A1", "B2", "C3"]);
        hub.set_deactivated("C3", true).unwrap();
        let actions = hub.on_datagram(&discovery::ping_datagram());
        let announced: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Announce { object, delay, .. } => {
                    assert!(*delay >= Duration::from_millis(1) && *delay <= Duration::from_millis(250));
                    Some(object.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec!["A1", "B2"]);
    }

    #[test]
    fn datagrams_reach_matrix_or_udp_listeners() {
        let mut hub = hub_with(&["A1"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (m, u) = (seen.clone(), seen.clone());
        hub.hardware_mut().add_matrix_listener(move |_| m.lock().unwrap().push("matrix"));
        hub.hardware_mut().add_udp_listener(move |_| u.lock().unwrap().push("udp"));
        hub.on_datagram(br#"{"matrixBroadcast":{"a":1}}"#);
        hub.on_datagram(br#"{"id":"B2","ip":"10.0.0.5"}"#);
        assert_eq!(*seen.lock().unwrap(), vec!["matrix", "udp"]);
        assert!(hub.known().contains("B2"));
    }

    #[test]
    fn link_changes_notify_connection_listeners() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let a = hub.registry_mut().add_node("A1", &f, Node::new("a")).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        hub.hardware_mut()
            .add_connection_listener(NodeKey::new("A1", &f, &a), move |ev| e.lock().unwrap().push(ev.added));
        let (id, _) = hub
            .add_link(Link::new(Endpoint::node("A1", &f, &a), Endpoint::node("B2", "g", "n")))
            .unwrap();
        hub.remove_link("A1", &f, &id).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn deleting_node_prunes_links() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let a = hub.registry_mut().add_node("A1", &f, Node::new("a")).unwrap();
        let b = hub.registry_mut().add_node("A1", &f, Node::new("b")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &f, &a), Endpoint::node("A1", &f, &b)))
            .unwrap();
        hub.registry_mut().remove_node("A1", &f, &b).unwrap();
        assert_eq!(hub.registry().links().count(), 0);
        assert!(hub.hardware_write("A1", &f, &a, &Data::with_value(1.0)).is_empty());
    }

    #[test]
    fn hardware_listener_sees_propagated_value_only() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let a = hub.registry_mut().add_node("A1", &f, Node::new("a")).unwrap();
        let b = hub.registry_mut().add_node("A1", &f, Node::new("b")).unwrap();
        hub.add_link(Link::new(Endpoint::node("A1", &f, &a), Endpoint::node("A1", &f, &b)))
            .unwrap();
        let reads = Arc::new(Mutex::new(Vec::new()));
        for n in [&a, &b] {
            let r = reads.clone();
            let tag = n.clone();
            hub.hardware_mut()
                .add_read_listener(NodeKey::new("A1", &f, n), move |d| r.lock().unwrap().push((tag.clone(), d.value)));
        }
        hub.hardware_write("A1", &f, &a, &Data::with_value(0.25));
        assert_eq!(*reads.lock().unwrap(), vec![(b.clone(), 0.25)]);
    }

    #[test]
    fn public_data_reaches_listener() {
        let mut hub = hub_with(&["A1"]);
        let f = frame_of("A1");
        let a = hub.registry_mut().add_node("A1", &f, Node::new("a")).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        hub.hardware_mut()
            .add_public_data_listener(NodeKey::new("A1", &f, &a), move |p| *s.lock().unwrap() = Some(p.clone()));
        let mut public = Map::new();
        public.insert("color".into(), Value::from("red"));
        hub.set_public_data("A1", &f, &a, public.clone()).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(public));
        assert!(hub.set_public_data("A1", &f, "missing", Map::new()).is_err());
    }

    #[test]
    fn heartbeat_uses_hub_address() {
        let hub = hub_with(&["A1"]);
        let hb = hub.heartbeat("A1").unwrap();
        assert_eq!(hb.ip, "127.0.0.1");
        assert_eq!(hb.pr, ProtocolVersion::R2);
        assert!(hub.heartbeat("missing").is_none());
    }

    #[test]
    fn lifecycle_hooks_run() {
        let mut hub = hub_with(&[]);
        let log = Arc::new(Mutex::new(Vec::new()));
        for (ev, tag) in [
            (HardwareEvent::Initialize, "init"),
            (HardwareEvent::Reset, "reset"),
            (HardwareEvent::Shutdown, "shutdown"),
        ] {
            let l = log.clone();
            hub.hardware_mut().add_event_listener(ev, move || l.lock().unwrap().push(tag));
        }
        hub.initialize();
        hub.reset();
        hub.shutdown();
        assert_eq!(*log.lock().unwrap(), vec!["init", "reset", "shutdown"]);
    }
}
