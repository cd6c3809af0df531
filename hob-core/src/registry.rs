//! In-memory store of objects and everything they own, with lookups by composite id
//! and the authoring API used by hosts and hardware interfaces.

use crate::identity;
use crate::keyed::Keyed;
use crate::model::{Block, BlockLink, Endpoint, Frame, Link, Node, Object};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("frame {0} is static and cannot be removed")]
    StaticFrame(String),
    #[error("node {0} is not a logic node")]
    NotLogic(String),
    #[error("edge block {0} cannot be removed")]
    EdgeBlock(String),
}

/// Outcome of adding a link or block link. Loops are stored but never traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Added,
    Loop,
}

#[derive(Debug, Default)]
pub struct Registry {
    objects: Keyed<Object>,
}

fn not_found(what: &str) -> RegistryError {
    RegistryError::NotFound(what.to_string())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, object: &str) -> bool {
        self.objects.contains_key(object)
    }

    /// Local and not deactivated: the only objects that propagate and announce themselves.
    pub fn is_active(&self, object: &str) -> bool {
        self.objects.get(object).is_some_and(|o| !o.deactivated)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &str> {
        self.objects.keys()
    }

    pub fn object(&self, object: &str) -> Option<&Object> {
        self.objects.get(object)
    }

    pub fn object_mut(&mut self, object: &str) -> Option<&mut Object> {
        self.objects.get_mut(object)
    }

    pub fn frame(&self, object: &str, frame: &str) -> Option<&Frame> {
        self.object(object)?.frames.get(frame)
    }

    pub fn frame_mut(&mut self, object: &str, frame: &str) -> Option<&mut Frame> {
        self.object_mut(object)?.frames.get_mut(frame)
    }

    pub fn node(&self, object: &str, frame: &str, node: &str) -> Option<&Node> {
        self.frame(object, frame)?.nodes.get(node)
    }

    pub fn node_mut(&mut self, object: &str, frame: &str, node: &str) -> Option<&mut Node> {
        self.frame_mut(object, frame)?.nodes.get_mut(node)
    }

    pub fn block(&self, object: &str, frame: &str, node: &str, block: &str) -> Option<&Block> {
        self.node(object, frame, node)?.logic_state()?.blocks.get(block)
    }

    pub fn block_mut(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        block: &str,
    ) -> Option<&mut Block> {
        self.node_mut(object, frame, node)?
            .logic_state_mut()?
            .blocks
            .get_mut(block)
    }

    /// Id of the first object whose display name is `name`.
    pub fn object_id_by_name(&self, name: &str) -> Option<&str> {
        self.objects
            .iter()
            .find(|(_, o)| o.name == name)
            .map(|(id, _)| id)
    }

    /// Search every frame of `object` for `node`. Used for messages that carry no frame.
    pub fn find_node(&self, object: &str, node: &str) -> Option<(&str, &Node)> {
        self.object(object)?
            .frames
            .iter()
            .find_map(|(fid, f)| f.nodes.get(node).map(|n| (fid, n)))
    }

    /// Every link of every local object, with the ids of the frame that owns it.
    pub fn links(&self) -> impl Iterator<Item = (&str, &str, &str, &Link)> {
        self.objects.iter().flat_map(|(oid, o)| {
            o.frames.iter().flat_map(move |(fid, f)| {
                f.links.iter().map(move |(lid, l)| (oid, fid, lid, l))
            })
        })
    }

    // Authoring.

    pub fn add_object(&mut self, object: Object) -> Result<(), RegistryError> {
        if self.exists(&object.id) {
            return Err(RegistryError::Duplicate(object.id));
        }
        self.objects.insert(object.id.clone(), object);
        Ok(())
    }

    pub fn remove_object(&mut self, object: &str) -> Result<Object, RegistryError> {
        let removed = self.objects.remove(object).ok_or_else(|| not_found(object))?;
        self.prune_links(|l| l.references(object, None, None));
        Ok(removed)
    }

    pub fn set_deactivated(&mut self, object: &str, deactivated: bool) -> Result<(), RegistryError> {
        let o = self.object_mut(object).ok_or_else(|| not_found(object))?;
        o.deactivated = deactivated;
        Ok(())
    }

    /// Add `frame` to `object`; its id is derived from the frame name.
    pub fn add_frame(&mut self, object: &str, frame: Frame) -> Result<String, RegistryError> {
        let o = self.object_mut(object).ok_or_else(|| not_found(object))?;
        let id = identity::frame_id(object, &frame.name);
        if o.frames.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        o.frames.insert(id.clone(), frame);
        Ok(id)
    }

    pub fn remove_frame(&mut self, object: &str, frame: &str) -> Result<Frame, RegistryError> {
        let o = self.object_mut(object).ok_or_else(|| not_found(object))?;
        match o.frames.get(frame) {
            None => return Err(not_found(frame)),
            Some(f) if f.static_copy => return Err(RegistryError::StaticFrame(frame.to_string())),
            Some(_) => {}
        }
        let removed = o.frames.remove(frame).ok_or_else(|| not_found(frame))?;
        self.prune_links(|l| l.references(object, Some(frame), None));
        Ok(removed)
    }

    /// Clone `frame` under `new_name`. Nodes get ids under the new frame, links get fresh ids,
    /// and link endpoints that pointed inside the source frame are rewritten to the copy.
    pub fn copy_frame(
        &mut self,
        object: &str,
        frame: &str,
        new_name: &str,
    ) -> Result<String, RegistryError> {
        let source = self.frame(object, frame).ok_or_else(|| not_found(frame))?;
        let new_id = identity::frame_id(object, new_name);
        if self.frame(object, &new_id).is_some() {
            return Err(RegistryError::Duplicate(new_id));
        }

        let mut copy = Frame {
            name: new_name.to_string(),
            static_copy: false,
            nodes: Keyed::new(),
            links: Keyed::new(),
            ..source.clone()
        };
        let mut renamed = Vec::new();
        for (old_id, node) in source.nodes.iter() {
            let nid = identity::node_id(&new_id, &node.name);
            renamed.push((old_id.to_string(), nid.clone()));
            copy.nodes.insert(nid, node.clone());
        }
        let rewrite = |e: &mut Endpoint| {
            if e.object == object && e.frame == frame {
                if let Some((_, nid)) = renamed.iter().find(|(old, _)| *old == e.node) {
                    e.frame = new_id.clone();
                    e.node = nid.clone();
                }
            }
        };
        for link in source.links.values() {
            let mut l = link.clone();
            rewrite(&mut l.source);
            rewrite(&mut l.destination);
            l.recheck_loop();
            copy.links.insert(identity::link_id(), l);
        }

        let o = self.object_mut(object).ok_or_else(|| not_found(object))?;
        o.frames.insert(new_id.clone(), copy);
        Ok(new_id)
    }

    /// Add `node` to a frame; its id is derived from the node name.
    pub fn add_node(&mut self, object: &str, frame: &str, node: Node) -> Result<String, RegistryError> {
        let f = self.frame_mut(object, frame).ok_or_else(|| not_found(frame))?;
        let id = identity::node_id(frame, &node.name);
        if f.nodes.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        f.nodes.insert(id.clone(), node);
        Ok(id)
    }

    pub fn add_logic_node(&mut self, object: &str, frame: &str, name: &str) -> Result<String, RegistryError> {
        self.add_node(object, frame, Node::logic(name))
    }

    pub fn remove_node(&mut self, object: &str, frame: &str, node: &str) -> Result<Node, RegistryError> {
        let f = self.frame_mut(object, frame).ok_or_else(|| not_found(frame))?;
        let removed = f.nodes.remove(node).ok_or_else(|| not_found(node))?;
        self.prune_links(|l| l.references(object, Some(frame), Some(node)));
        Ok(removed)
    }

    /// Change the display name. The id is left alone so links stay valid.
    pub fn rename_node(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        name: &str,
    ) -> Result<(), RegistryError> {
        let n = self.node_mut(object, frame, node).ok_or_else(|| not_found(node))?;
        n.name = name.to_string();
        Ok(())
    }

    /// Store `link` in its source frame under a fresh id.
    pub fn add_link(&mut self, link: Link) -> Result<(String, LinkStatus), RegistryError> {
        let id = identity::link_id();
        let status = self.insert_link(&id, link)?;
        Ok((id, status))
    }

    /// Store `link` in its source frame under `id`, replacing any link with that id.
    pub fn insert_link(&mut self, id: &str, link: Link) -> Result<LinkStatus, RegistryError> {
        let src = link.source.clone();
        let f = self
            .frame_mut(&src.object, &src.frame)
            .ok_or_else(|| not_found(&src.frame))?;
        let status = if link.is_loop() {
            LinkStatus::Loop
        } else {
            LinkStatus::Added
        };
        f.links.insert(id, link);
        Ok(status)
    }

    pub fn remove_link(&mut self, object: &str, frame: &str, link: &str) -> Result<Link, RegistryError> {
        let f = self.frame_mut(object, frame).ok_or_else(|| not_found(frame))?;
        f.links.remove(link).ok_or_else(|| not_found(link))
    }

    pub fn add_block(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        id: &str,
        block: Block,
    ) -> Result<(), RegistryError> {
        let state = self.logic_mut(object, frame, node)?;
        if state.blocks.contains_key(id) {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        state.blocks.insert(id, block);
        Ok(())
    }

    pub fn remove_block(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        block: &str,
    ) -> Result<Block, RegistryError> {
        if Block::is_edge(block) {
            return Err(RegistryError::EdgeBlock(block.to_string()));
        }
        let state = self.logic_mut(object, frame, node)?;
        let removed = state.blocks.remove(block).ok_or_else(|| not_found(block))?;
        state.links.retain(|_, l| !l.touches(block));
        Ok(removed)
    }

    pub fn add_block_link(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        id: &str,
        link: BlockLink,
    ) -> Result<LinkStatus, RegistryError> {
        let state = self.logic_mut(object, frame, node)?;
        let status = if link.is_loop() {
            LinkStatus::Loop
        } else {
            LinkStatus::Added
        };
        state.links.insert(id, link);
        Ok(status)
    }

    pub fn remove_block_link(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
        id: &str,
    ) -> Result<BlockLink, RegistryError> {
        let state = self.logic_mut(object, frame, node)?;
        state.links.remove(id).ok_or_else(|| not_found(id))
    }

    fn logic_mut(
        &mut self,
        object: &str,
        frame: &str,
        node: &str,
    ) -> Result<&mut crate::model::LogicState, RegistryError> {
        let n = self.node_mut(object, frame, node).ok_or_else(|| not_found(node))?;
        n.logic_state_mut()
            .ok_or_else(|| RegistryError::NotLogic(node.to_string()))
    }

    fn prune_links(&mut self, doomed: impl Fn(&Link) -> bool) {
        for o in self.objects.values_mut() {
            for f in o.frames.values_mut() {
                f.links.retain(|_, l| !doomed(l));
            }
        }
    }
}
