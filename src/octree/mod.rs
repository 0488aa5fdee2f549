//! Point cloud octree: naming, subdivision, hierarchy decoding and the
//! load-governed geometry tree

pub mod name;
pub mod version;
pub mod url;
pub mod hierarchy;
pub mod node;
pub mod tree;
pub mod geometry;

pub use geometry::{GeometrySettings, LoadOutcome, OctreeGeometry};
pub use hierarchy::{decode_hierarchy, encode_hierarchy, HierarchyChunk, NodeRecord, RECORD_SIZE};
pub use name::{index_from_name, ROOT_NAME};
pub use node::{GeometryNode, LoadState, LoadStateKind, NodeId, PointPayload};
pub use tree::OctreeTree;
pub use version::Version;
