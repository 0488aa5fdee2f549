//! pointstream - On-demand octree streaming for massive point clouds
//!
//! A statically partitioned point cloud is exposed as an octree whose nodes
//! fetch their point payloads lazily under a global in-flight budget. The
//! rendering / LOD selection layer walks the tree each frame and calls
//! [`OctreeGeometry::load`] and [`OctreeGeometry::dispose_node`].

pub mod core;
pub mod math;
pub mod octree;
pub mod streaming;

pub use crate::core::{Error, Result};
pub use octree::{GeometryNode, LoadOutcome, LoadState, NodeId, OctreeGeometry, Version};
pub use streaming::{FileFetcher, Fetch, FetchOptions, StreamingConfig};
