//! Propagation engine: walks links and block links depth-first from a changed node,
//! writing local destinations in place and collecting remote sends for the host.

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::bridge::{HardwareBridge, HardwareInterfaces};
use crate::discovery::DiscoveryTable;
use crate::model::{Block, BlockLink, Data, DataPatch, Endpoint, Link, Port, PORTS};
use crate::protocol::ValueMessage;
use crate::registry::Registry;
use crate::render::Renderers;

/// A value bound for a remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSend {
    pub address: String,
    pub object: String,
    pub message: ValueMessage,
}

/// What one propagation chain did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Propagation {
    /// Node renders that ran.
    pub triggers: usize,
    /// Block renders that ran.
    pub block_triggers: usize,
    /// Values written into local nodes by links.
    pub local_deliveries: usize,
    pub remote: Vec<RemoteSend>,
    /// Edges skipped because they were already on the active path.
    pub cut_edges: usize,
    /// Remote destinations with no discovery record.
    pub unroutable: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EdgeId {
    Link {
        object: String,
        frame: String,
        link: String,
    },
    Block {
        object: String,
        frame: String,
        node: String,
        link: String,
    },
}

/// One propagation chain. Borrows the hub state for its whole duration.
pub struct Engine<'a> {
    registry: &'a mut Registry,
    known: &'a DiscoveryTable,
    renderers: &'a Renderers,
    hardware: &'a mut HardwareInterfaces,
    bridge: &'a mut dyn HardwareBridge,
    active: HashSet<EdgeId>,
    report: Propagation,
}

impl<'a> Engine<'a> {
    pub fn new(
        registry: &'a mut Registry,
        known: &'a DiscoveryTable,
        renderers: &'a Renderers,
        hardware: &'a mut HardwareInterfaces,
        bridge: &'a mut dyn HardwareBridge,
    ) -> Self {
        Self {
            registry,
            known,
            renderers,
            hardware,
            bridge,
            active: HashSet::new(),
            report: Propagation::default(),
        }
    }

    pub fn finish(self) -> Propagation {
        self.report
    }

    /// Render a node and push the result along its outgoing links.
    pub fn trigger(&mut self, object: &str, frame: &str, node: &str) {
        if !self.registry.is_active(object) {
            trace!(object, "inactive object; not propagating");
            return;
        }
        let renderers = self.renderers;
        let Some(n) = self.registry.node(object, frame, node) else {
            return;
        };
        let Some(renderer) = renderers.node(&n.renderer) else {
            trace!(kind = %n.renderer, "no renderer for node type");
            return;
        };
        let Some(processed) = renderer.render(n) else {
            return;
        };
        self.report.triggers += 1;
        if let Some(n) = self.registry.node_mut(object, frame, node) {
            n.processed = Some(processed.clone());
        }
        self.process_links(object, frame, node, None, &processed);
    }

    /// Apply an inbound value message. Returns false when its destination does not resolve.
    pub fn apply(&mut self, msg: &ValueMessage) -> bool {
        match msg {
            ValueMessage::R2 {
                object,
                frame,
                node,
                logic,
                data,
            } => {
                if !self.registry.exists(object) {
                    return false;
                }
                match logic {
                    Some(port) => self.write_port(object, frame, node, *port, data),
                    None => self.write_node(object, frame, node, data, true),
                }
            }
            ValueMessage::R1 { object, node, data } => {
                let Some(frame) = self.frame_of(object, node) else {
                    return false;
                };
                self.write_node(object, &frame, node, data, true)
            }
            ValueMessage::R0 {
                obj,
                pos,
                value,
                mode,
            } => {
                let Some(frame) = self.frame_of(obj, pos) else {
                    return false;
                };
                let patch = DataPatch {
                    value: Some(*value),
                    mode: Some(*mode),
                    ..DataPatch::default()
                };
                self.write_node(obj, &frame, pos, &patch, true)
            }
        }
    }

    /// Store a value written by local hardware and propagate it.
    pub fn hardware_write(&mut self, object: &str, frame: &str, node: &str, data: &Data) -> bool {
        self.write_node(object, frame, node, &DataPatch::from(data), false)
    }

    fn frame_of(&self, object: &str, node: &str) -> Option<String> {
        self.registry
            .find_node(object, node)
            .map(|(frame, _)| frame.to_string())
    }

    /// Patch a plain node's value, tell the hardware about it when `notify`, then trigger.
    fn write_node(&mut self, object: &str, frame: &str, node: &str, patch: &DataPatch, notify: bool) -> bool {
        let Some(n) = self.registry.node_mut(object, frame, node) else {
            debug!(object, frame, node, "destination node not found");
            return false;
        };
        n.data.apply(patch);
        let stored = n.data.clone();
        if notify {
            self.hardware.read_call(object, frame, node, &stored);
            self.bridge.data(object, frame, node, &stored);
        }
        self.trigger(object, frame, node);
        true
    }

    /// Deliver into logic port `port`: input 0 of the `in<port>` edge block.
    fn write_port(&mut self, object: &str, frame: &str, node: &str, port: Port, patch: &DataPatch) -> bool {
        let edge = Block::input_edge(port);
        let Some(state) = self
            .registry
            .node_mut(object, frame, node)
            .and_then(|n| n.logic_state_mut())
        else {
            debug!(object, frame, node, "logic destination is not a logic node");
            return false;
        };
        let Some(block) = state.blocks.get_mut(edge) else {
            return false;
        };
        block.data[0].apply(patch);
        state.route_buffer[port.index()] = block.data[0].value;
        if !self.registry.is_active(object) {
            trace!(object, "inactive object; logic port stored only");
            return true;
        }
        self.block_trigger(object, frame, node, edge, Port::ALL[0]);
        true
    }

    /// Walk the frame's links leaving `node`. `exit` restricts to links leaving through that logic port.
    fn process_links(&mut self, object: &str, frame: &str, node: &str, exit: Option<Port>, data: &Data) {
        let Some(f) = self.registry.frame(object, frame) else {
            return;
        };
        let links: Vec<(String, Link)> = f
            .links
            .iter()
            .filter(|(_, l)| l.source.is_node(object, frame, node))
            .filter(|(_, l)| exit.map_or(true, |p| l.source.logic == Some(p)))
            .map(|(id, l)| (id.to_string(), l.clone()))
            .collect();

        for (id, link) in links {
            if link.is_loop() {
                continue;
            }
            let edge = EdgeId::Link {
                object: object.to_string(),
                frame: frame.to_string(),
                link: id,
            };
            if !self.enter(&edge) {
                continue;
            }
            self.deliver(&link.destination, data);
            self.active.remove(&edge);
        }
    }

    fn deliver(&mut self, dest: &Endpoint, data: &Data) {
        if !self.registry.is_active(&dest.object) {
            self.send_remote(dest, data);
            return;
        }
        let patch = DataPatch::from(data);
        let delivered = match dest.logic {
            None => self.write_node(&dest.object, &dest.frame, &dest.node, &patch, true),
            Some(port) => self.write_port(&dest.object, &dest.frame, &dest.node, port, &patch),
        };
        if delivered {
            self.report.local_deliveries += 1;
        }
    }

    fn send_remote(&mut self, dest: &Endpoint, data: &Data) {
        let Some(known) = self.known.get(&dest.object) else {
            debug!(object = %dest.object, "remote destination not discovered yet");
            self.report.unroutable += 1;
            return;
        };
        let message = ValueMessage::outbound(known.protocol, dest, data);
        trace!(address = %known.ip, object = %dest.object, protocol = %known.protocol, "remote send");
        self.report.remote.push(RemoteSend {
            address: known.ip.clone(),
            object: dest.object.clone(),
            message,
        });
    }

    fn block_trigger(&mut self, object: &str, frame: &str, node: &str, block_id: &str, index: Port) {
        let renderers = self.renderers;
        let Some(block) = self.registry.block_mut(object, frame, node, block_id) else {
            return;
        };
        let Some(renderer) = renderers.block(&block.kind) else {
            trace!(kind = %block.kind, "no renderer for block type");
            return;
        };
        let outputs = renderer.render(block, index);
        block.processed = outputs.clone();
        self.report.block_triggers += 1;
        self.process_block_links(object, frame, node, block_id, &outputs);
    }

    fn process_block_links(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        block_id: &str,
        outputs: &[Option<Data>; PORTS],
    ) {
        let exit = Block::output_edge_port(block_id);
        for (i, out) in outputs.iter().enumerate() {
            let Some(data) = out else {
                continue;
            };
            if let Some(k) = exit {
                self.process_links(object, frame, node, Some(k), data);
                continue;
            }
            let port = Port::ALL[i];
            let links: Vec<(String, BlockLink)> = self
                .registry
                .node(object, frame, node)
                .and_then(|n| n.logic_state())
                .map(|s| {
                    s.links
                        .iter()
                        .filter(|(_, l)| l.source.block == block_id && l.source.port == port)
                        .map(|(id, l)| (id.to_string(), l.clone()))
                        .collect()
                })
                .unwrap_or_default();

            for (id, link) in links {
                if link.is_loop() {
                    continue;
                }
                let edge = EdgeId::Block {
                    object: object.to_string(),
                    frame: frame.to_string(),
                    node: node.to_string(),
                    link: id,
                };
                if !self.enter(&edge) {
                    continue;
                }
                let to = &link.destination;
                if let Some(dest) = self.registry.block_mut(object, frame, node, &to.block) {
                    dest.data[to.port.index()] = data.clone();
                    self.block_trigger(object, frame, node, &to.block, to.port);
                }
                self.active.remove(&edge);
            }
        }
    }

    /// Put `edge` on the active path, or report it as a cut if it already is.
    fn enter(&mut self, edge: &EdgeId) -> bool {
        if self.active.contains(edge) {
            warn!(?edge, "cycle detected; cutting propagation");
            self.report.cut_edges += 1;
            return false;
        }
        self.active.insert(edge.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullBridge;
    use crate::discovery::KnownObject;
    use crate::model::{BlockPort, Frame, Node, Object};
    use crate::protocol::ProtocolVersion;

    struct Fixture {
        registry: Registry,
        known: DiscoveryTable,
        renderers: Renderers,
        hardware: HardwareInterfaces,
        bridge: NullBridge,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Registry::new(),
                known: DiscoveryTable::new(),
                renderers: Renderers::default(),
                hardware: HardwareInterfaces::new(),
                bridge: NullBridge,
            }
        }

        fn engine(&mut self) -> Engine<'_> {
            Engine::new(
                &mut self.registry,
                &self.known,
                &self.renderers,
                &mut self.hardware,
                &mut self.bridge,
            )
        }

        fn object(&mut self, id: &str) -> (String, String) {
            self.registry.add_object(Object::with_id(id, id, "127.0.0.1")).unwrap();
            let f = self.registry.add_frame(id, Frame::new("f")).unwrap();
            (id.to_string(), f)
        }
    }

    #[test]
    fn unknown_node_type_is_silent() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let a = fx.registry.add_node(&o, &f, Node::with_renderer("a", "graph")).unwrap();
        let b = fx.registry.add_node(&o, &f, Node::new("b")).unwrap();
        fx.registry
            .add_link(Link::new(Endpoint::node(&o, &f, &a), Endpoint::node(&o, &f, &b)))
            .unwrap();
        let mut e = fx.engine();
        e.trigger(&o, &f, &a);
        assert_eq!(e.finish(), Propagation::default());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let ids: Vec<String> = ["s", "l", "r", "t"]
            .iter()
            .map(|n| fx.registry.add_node(&o, &f, Node::new(n)).unwrap())
            .collect();
        for (x, y) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
            fx.registry
                .add_link(Link::new(
                    Endpoint::node(&o, &f, &ids[x]),
                    Endpoint::node(&o, &f, &ids[y]),
                ))
                .unwrap();
        }
        let mut e = fx.engine();
        e.trigger(&o, &f, &ids[0]);
        let report = e.finish();
        assert_eq!(report.cut_edges, 0);
        assert_eq!(report.local_deliveries, 4);
    }

    #[test]
    fn remote_without_discovery_is_unroutable() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let a = fx.registry.add_node(&o, &f, Node::new("a")).unwrap();
        fx.registry
            .add_link(Link::new(Endpoint::node(&o, &f, &a), Endpoint::node("Z9", "Z9f", "n")))
            .unwrap();
        let mut e = fx.engine();
        e.trigger(&o, &f, &a);
        let report = e.finish();
        assert!(report.remote.is_empty());
        assert_eq!(report.unroutable, 1);
    }

    #[test]
    fn r1_message_uses_protocol_of_destination() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let a = fx.registry.add_node(&o, &f, Node::new("a")).unwrap();
        fx.registry
            .add_link(Link::new(Endpoint::node(&o, &f, &a), Endpoint::node("old", "oldf", "oldn")))
            .unwrap();
        fx.known.insert(
            "old",
            KnownObject {
                ip: "10.0.0.9".into(),
                protocol: ProtocolVersion::R1,
                version: 200,
            },
        );
        let mut e = fx.engine();
        e.trigger(&o, &f, &a);
        let report = e.finish();
        assert_eq!(report.remote.len(), 1);
        assert_eq!(report.remote[0].message.version(), ProtocolVersion::R1);
    }

    #[test]
    fn block_links_follow_source_port() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let logic = fx.registry.add_logic_node(&o, &f, "L").unwrap();
        let sink = fx.registry.add_node(&o, &f, Node::new("sink")).unwrap();
        fx.registry
            .add_block_link(
                &o,
                &f,
                &logic,
                "bl",
                BlockLink::new(BlockPort::new("in1", Port::ALL[0]), BlockPort::new("out1", Port::ALL[0])),
            )
            .unwrap();
        fx.registry
            .add_link(Link::new(
                Endpoint::port(&o, &f, &logic, Port::ALL[1]),
                Endpoint::node(&o, &f, &sink),
            ))
            .unwrap();
        let mut e = fx.engine();
        assert!(e.apply(&ValueMessage::R2 {
            object: o.clone(),
            frame: f.clone(),
            node: logic.clone(),
            logic: Port::new(1),
            data: DataPatch {
                value: Some(0.6),
                ..DataPatch::default()
            },
        }));
        let report = e.finish();
        assert_eq!(report.block_triggers, 2);
        assert_eq!(fx.registry.node(&o, &f, &sink).unwrap().data.value, 0.6);
    }

    #[test]
    fn inbound_to_unknown_object_has_no_effect() {
        let mut fx = Fixture::new();
        fx.object("A1");
        let mut e = fx.engine();
        let msg = ValueMessage::R2 {
            object: "nope".into(),
            frame: "x".into(),
            node: "y".into(),
            logic: None,
            data: DataPatch::default(),
        };
        assert!(!e.apply(&msg));
        assert_eq!(e.finish(), Propagation::default());
    }

    #[test]
    fn r0_message_finds_node_in_any_frame() {
        let mut fx = Fixture::new();
        let (o, _) = fx.object("A1");
        let g = fx.registry.add_frame(&o, Frame::new("g")).unwrap();
        let n = fx.registry.add_node(&o, &g, Node::new("led")).unwrap();
        let mut e = fx.engine();
        assert!(e.apply(&ValueMessage::R0 {
            obj: o.clone(),
            pos: n.clone(),
            value: 1.0,
            mode: crate::model::DataMode::Digital,
        }));
        let stored = &fx.registry.node(&o, &g, &n).unwrap().data;
        assert_eq!(stored.value, 1.0);
        assert_eq!(stored.mode, crate::model::DataMode::Digital);
    }

    #[test]
    fn deactivated_object_stores_but_does_not_propagate() {
        let mut fx = Fixture::new();
        let (o, f) = fx.object("A1");
        let a = fx.registry.add_node(&o, &f, Node::new("a")).unwrap();
        let b = fx.registry.add_node(&o, &f, Node::new("b")).unwrap();
        fx.registry
            .add_link(Link::new(Endpoint::node(&o, &f, &a), Endpoint::node(&o, &f, &b)))
            .unwrap();
        fx.registry.set_deactivated(&o, true).unwrap();
        let mut e = fx.engine();
        e.hardware_write(&o, &f, &a, &Data::with_value(0.9));
        assert_eq!(e.finish().triggers, 0);
        assert_eq!(fx.registry.node(&o, &f, &a).unwrap().data.value, 0.9);
        assert_eq!(fx.registry.node(&o, &f, &b).unwrap().data.value, 0.0);
    }
}
