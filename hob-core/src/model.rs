//! Object / frame / node / link / block data model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keyed::Keyed;
use crate::protocol::{ProtocolVersion, SERVER_VERSION};

/// Number of logic ports on a logic node and of input/output ports on a block.
pub const PORTS: usize = 4;

/// Renderer type of a plain node.
pub const NODE_TYPE: &str = "node";
/// Renderer type of a logic node.
pub const LOGIC_TYPE: &str = "logic";
/// Block computation used by edge blocks.
pub const DEFAULT_BLOCK_TYPE: &str = "default";

const INPUT_EDGES: [&str; PORTS] = ["in0", "in1", "in2", "in3"];
const OUTPUT_EDGES: [&str; PORTS] = ["out0", "out1", "out2", "out3"];

/// Logic port index, always in 0..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Port(u8);

impl Port {
    pub const ALL: [Port; PORTS] = [Port(0), Port(1), Port(2), Port(3)];

    pub fn new(index: u8) -> Option<Port> {
        (usize::from(index) < PORTS).then_some(Port(index))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl TryFrom<u8> for Port {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Port::new(value).ok_or_else(|| format!("logic port {value} out of range"))
    }
}

impl From<Port> for u8 {
    fn from(p: Port) -> u8 {
        p.0
    }
}

/// How a value is to be interpreted. Wire codes: `f`, `d`, `+`, `-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataMode {
    #[default]
    #[serde(rename = "f")]
    Float,
    #[serde(rename = "d")]
    Digital,
    #[serde(rename = "+")]
    PositiveStep,
    #[serde(rename = "-")]
    NegativeStep,
}

impl DataMode {
    pub fn code(self) -> &'static str {
        match self {
            DataMode::Float => "f",
            DataMode::Digital => "d",
            DataMode::PositiveStep => "+",
            DataMode::NegativeStep => "-",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "f" => Some(DataMode::Float),
            "d" => Some(DataMode::Digital),
            "+" => Some(DataMode::PositiveStep),
            "-" => Some(DataMode::NegativeStep),
            _ => None,
        }
    }
}

/// The value record carried by nodes and block ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Data {
    pub value: f64,
    pub mode: DataMode,
    pub unit: String,
    pub unit_min: f64,
    pub unit_max: f64,
}

impl Default for Data {
    fn default() -> Self {
        Self {
            value: 0.0,
            mode: DataMode::Float,
            unit: String::new(),
            unit_min: 0.0,
            unit_max: 1.0,
        }
    }
}

impl Data {
    pub fn with_value(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Overwrite the fields present in `patch`.
    pub fn apply(&mut self, patch: &DataPatch) {
        if let Some(v) = patch.value {
            self.value = v;
        }
        if let Some(m) = patch.mode {
            self.mode = m;
        }
        if let Some(u) = &patch.unit {
            self.unit = u.clone();
        }
        if let Some(v) = patch.unit_min {
            self.unit_min = v;
        }
        if let Some(v) = patch.unit_max {
            self.unit_max = v;
        }
    }
}

/// A partial `Data` as received from the wire: only the fields present are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DataMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_max: Option<f64>,
}

impl From<&Data> for DataPatch {
    fn from(d: &Data) -> Self {
        Self {
            value: Some(d.value),
            mode: Some(d.mode),
            unit: Some(d.unit.clone()),
            unit_min: Some(d.unit_min),
            unit_max: Some(d.unit_max),
        }
    }
}

/// One end of a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub object: String,
    pub frame: String,
    pub node: String,
    #[serde(default)]
    pub logic: Option<Port>,
}

impl Endpoint {
    pub fn node(object: &str, frame: &str, node: &str) -> Self {
        Self {
            object: object.to_string(),
            frame: frame.to_string(),
            node: node.to_string(),
            logic: None,
        }
    }

    pub fn port(object: &str, frame: &str, node: &str, port: Port) -> Self {
        Self {
            logic: Some(port),
            ..Self::node(object, frame, node)
        }
    }

    pub fn is_node(&self, object: &str, frame: &str, node: &str) -> bool {
        self.object == object && self.frame == frame && self.node == node
    }
}

/// Directed edge between two node endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(rename = "loop", default)]
    looped: bool,
}

impl Link {
    pub fn new(source: Endpoint, destination: Endpoint) -> Self {
        let looped = source == destination;
        Self {
            source,
            destination,
            looped,
        }
    }

    /// Self-referential links are flagged at creation and never traversed.
    pub fn is_loop(&self) -> bool {
        self.looped
    }

    pub(crate) fn recheck_loop(&mut self) {
        self.looped = self.source == self.destination;
    }

    pub fn references(&self, object: &str, frame: Option<&str>, node: Option<&str>) -> bool {
        [&self.source, &self.destination].into_iter().any(|e| {
            e.object == object
                && frame.map_or(true, |f| e.frame == f)
                && node.map_or(true, |n| e.node == n)
        })
    }
}

/// A port on a block inside a logic node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPort {
    pub block: String,
    pub port: Port,
}

impl BlockPort {
    pub fn new(block: &str, port: Port) -> Self {
        Self {
            block: block.to_string(),
            port,
        }
    }
}

/// Directed edge between two block ports of the same logic node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockLink {
    pub source: BlockPort,
    pub destination: BlockPort,
    #[serde(rename = "loop", default)]
    looped: bool,
}

impl BlockLink {
    pub fn new(source: BlockPort, destination: BlockPort) -> Self {
        let looped = source == destination;
        Self {
            source,
            destination,
            looped,
        }
    }

    pub fn is_loop(&self) -> bool {
        self.looped
    }

    pub(crate) fn recheck_loop(&mut self) {
        self.looped = self.source == self.destination;
    }

    pub fn touches(&self, block: &str) -> bool {
        self.source.block == block || self.destination.block == block
    }
}

/// A 4-in / 4-out computation unit inside a logic node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Block {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: [Data; PORTS],
    #[serde(skip)]
    pub processed: [Option<Data>; PORTS],
    pub private_data: Map<String, Value>,
    pub public_data: Map<String, Value>,
    pub x: f64,
    pub y: f64,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: DEFAULT_BLOCK_TYPE.to_string(),
            data: Default::default(),
            processed: Default::default(),
            private_data: Map::new(),
            public_data: Map::new(),
            x: 0.0,
            y: 0.0,
        }
    }
}

impl Block {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    /// Id of the edge block that receives values arriving on logic port `port`.
    pub fn input_edge(port: Port) -> &'static str {
        INPUT_EDGES[port.index()]
    }

    /// Id of the edge block that emits values leaving on logic port `port`.
    pub fn output_edge(port: Port) -> &'static str {
        OUTPUT_EDGES[port.index()]
    }

    /// Logic port selected by an `out0..out3` edge block id.
    pub fn output_edge_port(block_id: &str) -> Option<Port> {
        OUTPUT_EDGES
            .iter()
            .position(|e| *e == block_id)
            .and_then(|i| Port::new(i as u8))
    }

    pub fn is_edge(block_id: &str) -> bool {
        INPUT_EDGES.contains(&block_id) || OUTPUT_EDGES.contains(&block_id)
    }
}

/// Blocks, block links and the per-port route buffer of a logic node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogicState {
    pub blocks: Keyed<Block>,
    pub links: Keyed<BlockLink>,
    pub route_buffer: [f64; PORTS],
}

impl LogicState {
    fn with_edges() -> Self {
        let mut state = LogicState::default();
        for id in INPUT_EDGES.iter().chain(OUTPUT_EDGES.iter()) {
            state.blocks.insert(*id, Block::new(id, DEFAULT_BLOCK_TYPE));
        }
        state
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    #[default]
    Plain,
    Logic(LogicState),
}

/// Single-valued IO endpoint owned by a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub name: String,
    /// Selects the renderer that turns `data` into the propagated value.
    #[serde(rename = "type")]
    pub renderer: String,
    pub data: Data,
    #[serde(skip)]
    pub processed: Option<Data>,
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub private_data: Map<String, Value>,
    pub public_data: Map<String, Value>,
    pub kind: NodeKind,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            name: String::new(),
            renderer: NODE_TYPE.to_string(),
            data: Data::default(),
            processed: None,
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            private_data: Map::new(),
            public_data: Map::new(),
            kind: NodeKind::Plain,
        }
    }
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_renderer(name: &str, renderer: &str) -> Self {
        Self {
            renderer: renderer.to_string(),
            ..Self::new(name)
        }
    }

    /// A logic node with its eight edge blocks.
    pub fn logic(name: &str) -> Self {
        Self {
            renderer: LOGIC_TYPE.to_string(),
            kind: NodeKind::Logic(LogicState::with_edges()),
            ..Self::new(name)
        }
    }

    pub fn logic_state(&self) -> Option<&LogicState> {
        match &self.kind {
            NodeKind::Logic(l) => Some(l),
            NodeKind::Plain => None,
        }
    }

    pub fn logic_state_mut(&mut self) -> Option<&mut LogicState> {
        match &mut self.kind {
            NodeKind::Logic(l) => Some(l),
            NodeKind::Plain => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visualization {
    #[default]
    Ar,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArPosition {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub matrix: Vec<f64>,
}

impl Default for ArPosition {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            matrix: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenPosition {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl Default for ScreenPosition {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
        }
    }
}

/// A tool instance attached to an object; hosts nodes and the links leaving them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Frame {
    pub name: String,
    pub visualization: Visualization,
    pub ar: ArPosition,
    pub screen: ScreenPosition,
    /// Static frames cannot be deleted; editors pull copies from them instead.
    pub static_copy: bool,
    pub nodes: Keyed<Node>,
    pub links: Keyed<Link>,
    pub private_data: Map<String, Value>,
    pub public_data: Map<String, Value>,
}

impl Frame {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Addressable anchor: the unit of network identity and discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Object {
    #[serde(rename = "objectId")]
    pub id: String,
    pub name: String,
    pub ip: String,
    pub version: String,
    pub protocol: ProtocolVersion,
    pub deactivated: bool,
    /// Target checksum.
    pub tcs: u32,
    pub zone: String,
    pub frames: Keyed<Frame>,
}

impl Default for Object {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            ip: String::new(),
            version: SERVER_VERSION.to_string(),
            protocol: crate::protocol::PROTOCOL_VERSION,
            deactivated: false,
            tcs: 0,
            zone: String::new(),
            frames: Keyed::new(),
        }
    }
}

impl Object {
    /// New object with a freshly generated identifier.
    pub fn new(name: &str, ip: &str) -> Self {
        Self::with_id(&crate::identity::object_id(name), name, ip)
    }

    pub fn with_id(id: &str, name: &str, ip: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
            ..Self::default()
        }
    }
}
