//! Octree node arena.
//!
//! Owns every materialized [`GeometryNode`], hands out [`NodeId`]s from a
//! per-tree counter and is the only place children get attached.

use std::collections::HashMap;

use crate::core::{Error, Result};
use crate::math::Aabb;

use super::hierarchy::HierarchyChunk;
use super::name::{child_name, index_from_name, parent_name, validate_name, ROOT_NAME};
use super::node::{GeometryNode, LoadStateKind, NodeId};

/// Arena of octree nodes addressed by id and by name
pub struct OctreeTree {
    nodes: HashMap<NodeId, GeometryNode>,
    names: HashMap<String, NodeId>,
    root: NodeId,
    next_id: u64,
    /// Point spacing at the root level
    spacing: f64,
}

impl OctreeTree {
    /// Create a tree holding only the root node `"r"`
    ///
    /// The root is assumed to have children until hierarchy data says
    /// otherwise.
    pub fn new(bounding_box: Aabb, spacing: f64) -> Self {
        let root_id = NodeId(0);
        let mut root = GeometryNode::new(root_id, ROOT_NAME.to_string(), bounding_box);
        root.spacing = spacing;
        root.has_children = true;

        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);
        let mut names = HashMap::new();
        names.insert(ROOT_NAME.to_string(), root_id);

        Self {
            nodes,
            names,
            root: root_id,
            next_id: 1,
            spacing,
        }
    }

    /// Allocate a fresh node ID.
    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Base point spacing of the dataset
    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn get(&self, id: NodeId) -> Option<&GeometryNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut GeometryNode> {
        self.nodes.get_mut(&id)
    }

    /// Look up a materialized node by name
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeometryNode> + '_ {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GeometryNode> + '_ {
        self.nodes.values_mut()
    }

    /// Number of nodes currently in the given load state
    pub fn count_in_state(&self, kind: LoadStateKind) -> usize {
        self.nodes.values().filter(|n| n.state().kind() == kind).count()
    }

    /// Attach child `index` below `parent`, or update it if already present
    ///
    /// The child's name, bounds, level and spacing all follow from the parent
    /// and the index. Returns the child's id and whether it was created.
    pub fn upsert_child(
        &mut self,
        parent: NodeId,
        index: u8,
        num_points: u32,
        has_children: bool,
    ) -> Result<(NodeId, bool)> {
        if index >= 8 {
            return Err(Error::Decode(format!("child index {index} out of range")));
        }
        let parent_node = self.nodes.get(&parent).ok_or(Error::UnknownNode(parent))?;

        if let Some(existing) = parent_node.children[index as usize] {
            if let Some(child) = self.nodes.get_mut(&existing) {
                child.num_points = num_points;
                child.has_children = has_children;
            }
            return Ok((existing, false));
        }

        let name = child_name(parent_node.name(), index);
        let bounding_box = parent_node.bounding_box().child_octant(index);

        let id = self.alloc_id();
        let mut child = GeometryNode::new(id, name.clone(), bounding_box);
        child.spacing = self.spacing / 2f64.powi(child.level() as i32);
        child.num_points = num_points;
        child.has_children = has_children;
        child.parent = Some(parent);

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children[index as usize] = Some(id);
        }
        self.names.insert(name, id);
        self.nodes.insert(id, child);

        Ok((id, true))
    }

    /// Materialize the nodes described by a decoded hierarchy chunk
    ///
    /// `node` is the node the chunk was requested for; its point count is
    /// updated in place. Records arrive breadth-first, so every parent is
    /// materialized before its children. Returns the number of new nodes.
    pub fn apply_hierarchy(&mut self, node: NodeId, chunk: &HierarchyChunk) -> Result<usize> {
        let requesting = self.nodes.get_mut(&node).ok_or(Error::UnknownNode(node))?;
        if requesting.name() != chunk.root.name {
            return Err(Error::Decode(format!(
                "chunk for {} applied to node {}",
                chunk.root.name,
                requesting.name()
            )));
        }
        requesting.num_points = chunk.root.num_points;

        let mut created = 0;
        for record in &chunk.descendants {
            let parent = parent_name(&record.name)
                .and_then(|p| self.find(p))
                .ok_or_else(|| Error::Decode(format!("no parent for record {}", record.name)))?;

            let index = index_from_name(&record.name);
            let (_, is_new) =
                self.upsert_child(parent, index, record.num_points, record.has_children())?;
            if is_new {
                created += 1;
            }
        }

        Ok(created)
    }

    /// Materialize a complete `(name, point count)` listing
    ///
    /// Older datasets list the whole hierarchy in their metadata. Entries may
    /// come in any order as long as every node's parent is listed too.
    pub fn apply_flat_hierarchy(&mut self, entries: &[(String, u32)]) -> Result<usize> {
        for (name, _) in entries {
            validate_name(name)?;
        }

        let mut sorted: Vec<&(String, u32)> = entries.iter().collect();
        sorted.sort_by_key(|(name, _)| name.len());

        let mut created = 0;
        for (name, num_points) in sorted {
            let Some(parent) = parent_name(name) else {
                if let Some(root) = self.nodes.get_mut(&self.root) {
                    root.num_points = *num_points;
                }
                continue;
            };

            let parent_id = self
                .find(parent)
                .ok_or_else(|| Error::Metadata(format!("hierarchy entry {name} has no parent")))?;
            if let Some(parent_node) = self.nodes.get_mut(&parent_id) {
                parent_node.has_children = true;
            }

            let (_, is_new) =
                self.upsert_child(parent_id, index_from_name(name), *num_points, false)?;
            if is_new {
                created += 1;
            }
        }

        Ok(created)
    }

    /// Visit `start` (if `include_self`) and every node below it
    ///
    /// Each reachable node is visited exactly once. The order is a
    /// depth-first stack walk and is not otherwise guaranteed.
    pub fn traverse(&self, start: NodeId, include_self: bool, mut visit: impl FnMut(&GeometryNode)) {
        let mut stack: Vec<NodeId> = Vec::new();
        match self.nodes.get(&start) {
            Some(node) if include_self => stack.push(node.id()),
            Some(node) => stack.extend(node.children().iter().flatten()),
            None => return,
        }

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            visit(node);
            stack.extend(node.children().iter().flatten());
        }
    }

    /// Ids of `start` (if `include_self`) and every node below it
    pub fn subtree_ids(&self, start: NodeId, include_self: bool) -> Vec<NodeId> {
        let mut ids = Vec::new();
        self.traverse(start, include_self, |node| ids.push(node.id()));
        ids
    }
}
