//! Pluggable computations: node renderers keyed by node type, block renderers keyed by block type.

use std::collections::HashMap;

use crate::model::{Block, Data, Node, Port, DEFAULT_BLOCK_TYPE, LOGIC_TYPE, NODE_TYPE, PORTS};

/// Turns a node's stored value into the value it propagates. `None` stops propagation.
pub trait NodeRenderer: Send + Sync {
    fn render(&self, node: &Node) -> Option<Data>;
}

/// Computes a block's outputs after input `index` changed. Only `Some` outputs propagate.
/// The block is mutable so that a computation can keep state in its private data.
pub trait BlockRenderer: Send + Sync {
    fn render(&self, block: &mut Block, index: Port) -> [Option<Data>; PORTS];
}

/// Propagates the node value unchanged.
pub struct PassThrough;

impl NodeRenderer for PassThrough {
    fn render(&self, node: &Node) -> Option<Data> {
        Some(node.data.clone())
    }
}

/// Copies input `index` to output `index`. Used by edge blocks.
pub struct DefaultBlock;

impl BlockRenderer for DefaultBlock {
    fn render(&self, block: &mut Block, index: Port) -> [Option<Data>; PORTS] {
        let mut out: [Option<Data>; PORTS] = Default::default();
        out[index.index()] = Some(block.data[index.index()].clone());
        out
    }
}

/// Mirrors input `index` within its unit range onto output `index`.
pub struct InvertBlock;

impl BlockRenderer for InvertBlock {
    fn render(&self, block: &mut Block, index: Port) -> [Option<Data>; PORTS] {
        let mut out: [Option<Data>; PORTS] = Default::default();
        let input = &block.data[index.index()];
        out[index.index()] = Some(Data {
            value: input.unit_min + input.unit_max - input.value,
            ..input.clone()
        });
        out
    }
}

/// Type name -> computation tables.
pub struct Renderers {
    nodes: HashMap<String, Box<dyn NodeRenderer>>,
    blocks: HashMap<String, Box<dyn BlockRenderer>>,
}

impl Renderers {
    /// No renderers at all: every node and block type is a no-op.
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    /// `node`, `logic`, `default` and `invert`.
    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register_node(NODE_TYPE, PassThrough);
        r.register_node(LOGIC_TYPE, PassThrough);
        r.register_block(DEFAULT_BLOCK_TYPE, DefaultBlock);
        r.register_block("invert", InvertBlock);
        r
    }

    pub fn register_node(&mut self, kind: &str, renderer: impl NodeRenderer + 'static) {
        self.nodes.insert(kind.to_string(), Box::new(renderer));
    }

    pub fn register_block(&mut self, kind: &str, renderer: impl BlockRenderer + 'static) {
        self.blocks.insert(kind.to_string(), Box::new(renderer));
    }

    pub fn node(&self, kind: &str) -> Option<&dyn NodeRenderer> {
        self.nodes.get(kind).map(|b| b.as_ref())
    }

    pub fn block(&self, kind: &str) -> Option<&dyn BlockRenderer> {
        self.blocks.get(kind).map(|b| b.as_ref())
    }
}

impl Default for Renderers {
    fn default() -> Self {
        Self::with_builtins()
    }
}
