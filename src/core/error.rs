//! Error types for pointstream

use thiserror::Error;

use crate::octree::node::NodeId;

/// Main error type for the streaming engine
///
/// A load that is declined by admission control is not an error; see
/// [`crate::octree::LoadOutcome::Declined`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hierarchy decode error: {0}")]
    Decode(String),

    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    #[error("Invalid node name: {0:?}")]
    InvalidName(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Octree geometry was disposed while loading node {0}")]
    Disposed(String),
}
