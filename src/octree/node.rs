//! Octree geometry node: identity, bounds, links and load state.

use std::fmt;

use crate::core::types::DVec3;
use crate::math::{Aabb, Sphere};

use super::name::{index_from_name, level_from_name};

/// Unique identifier of a node within one octree session
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point data owned by a loaded node
#[derive(Clone, Debug, PartialEq)]
pub struct PointPayload {
    pub data: Vec<u8>,
}

impl PointPayload {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Size of the payload in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Load state of a node
#[derive(Clone, Debug, Default, PartialEq)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded(PointPayload),
    Failed,
}

impl LoadState {
    pub fn kind(&self) -> LoadStateKind {
        match self {
            LoadState::Unloaded => LoadStateKind::Unloaded,
            LoadState::Loading => LoadStateKind::Loading,
            LoadState::Loaded(_) => LoadStateKind::Loaded,
            LoadState::Failed => LoadStateKind::Failed,
        }
    }
}

/// Payload-free discriminant of [`LoadState`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadStateKind {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Callback run once when a node releases its payload
pub type DisposeHandler = Box<dyn FnOnce() + Send>;

/// A node of the point cloud octree
///
/// Nodes live in the arena of their [`OctreeTree`](super::tree::OctreeTree)
/// and refer to each other by [`NodeId`]. Children are only ever attached
/// through the tree so that `children[i].index == i` and
/// `children[i].parent == self` always hold.
pub struct GeometryNode {
    id: NodeId,
    name: String,
    index: u8,
    level: u32,
    pub(crate) spacing: f64,

    bounding_box: Aabb,
    pub(crate) tight_bounding_box: Aabb,
    bounding_sphere: Sphere,
    pub(crate) mean: DVec3,

    pub(crate) num_points: u32,
    pub(crate) has_children: bool,

    pub(crate) parent: Option<NodeId>,
    pub(crate) children: [Option<NodeId>; 8],

    pub(crate) state: LoadState,
    pub(crate) dispose_handlers: Vec<DisposeHandler>,
}

impl GeometryNode {
    /// Create a detached node. Index and level are derived from `name`.
    pub(crate) fn new(id: NodeId, name: String, bounding_box: Aabb) -> Self {
        Self {
            id,
            index: index_from_name(&name),
            level: level_from_name(&name),
            name,
            spacing: 0.0,
            bounding_box,
            tight_bounding_box: bounding_box,
            bounding_sphere: bounding_box.bounding_sphere(),
            mean: DVec3::ZERO,
            num_points: 0,
            has_children: false,
            parent: None,
            children: [None; 8],
            state: LoadState::Unloaded,
            dispose_handlers: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot (0-7) of this node in its parent
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Point spacing at this level
    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn bounding_box(&self) -> &Aabb {
        &self.bounding_box
    }

    pub fn tight_bounding_box(&self) -> &Aabb {
        &self.tight_bounding_box
    }

    pub fn bounding_sphere(&self) -> &Sphere {
        &self.bounding_sphere
    }

    /// Centroid of the node's points, zero until reported
    pub fn mean(&self) -> DVec3 {
        self.mean
    }

    /// Point count, known from hierarchy metadata before the payload loads
    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    /// Whether hierarchy metadata declares children, materialized or not
    pub fn has_children(&self) -> bool {
        self.has_children
    }

    /// True until a first child node is attached
    pub fn is_leaf_node(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[Option<NodeId>; 8] {
        &self.children
    }

    pub fn child(&self, index: u8) -> Option<NodeId> {
        self.children.get(index as usize).copied().flatten()
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, LoadState::Loading)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LoadState::Loaded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, LoadState::Failed)
    }

    /// Payload of a loaded node
    pub fn payload(&self) -> Option<&PointPayload> {
        match &self.state {
            LoadState::Loaded(payload) => Some(payload),
            _ => None,
        }
    }

    /// Register a callback to run the next time the payload is released
    pub(crate) fn add_dispose_handler(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.dispose_handlers.push(Box::new(handler));
    }

    /// Take the payload and pending dispose handlers
    ///
    /// No-op unless the node owns a payload and has a parent; the root's
    /// payload is never released this way. The handler list is emptied, so
    /// a second call is a pure no-op.
    pub(crate) fn dispose(&mut self) -> Option<Released> {
        if self.parent.is_none() || !self.is_loaded() {
            return None;
        }

        match std::mem::take(&mut self.state) {
            LoadState::Loaded(payload) => Some(Released {
                payload,
                handlers: std::mem::take(&mut self.dispose_handlers),
            }),
            other => {
                self.state = other;
                None
            }
        }
    }
}

/// Payload released by a dispose, with the handlers still to run
pub(crate) struct Released {
    pub payload: PointPayload,
    handlers: Vec<DisposeHandler>,
}

impl Released {
    /// Run the one-time dispose handlers and hand back the payload
    pub fn run_handlers(self) -> PointPayload {
        for handler in self.handlers {
            handler();
        }
        self.payload
    }
}

impl fmt::Debug for GeometryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeometryNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("num_points", &self.num_points)
            .field("has_children", &self.has_children)
            .field("state", &self.state.kind())
            .field("dispose_handlers", &self.dispose_handlers.len())
            .finish()
    }
}
