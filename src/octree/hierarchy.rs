//! Binary hierarchy chunk decoding.
//!
//! A chunk describes the subtree below the node that requested it as a flat
//! run of fixed-size little-endian records:
//!
//! | Offset | Size | Field                                        |
//! |--------|------|----------------------------------------------|
//! | 0      | 1    | child bitmask (bit i set = child i present)  |
//! | 1      | 4    | point count (u32)                            |
//!
//! Records carry no names or lengths. Their position alone identifies them,
//! so they must be read breadth-first: records are consumed in the order they
//! were discovered, and each record's children in ascending bit order.

use std::collections::VecDeque;

use crate::core::{Error, Result};

use super::name::child_name;

/// Size of one hierarchy record in bytes
pub const RECORD_SIZE: usize = 5;

/// One decoded hierarchy record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub child_mask: u8,
    pub num_points: u32,
}

impl NodeRecord {
    pub fn has_children(&self) -> bool {
        self.child_mask != 0
    }
}

/// Result of decoding one hierarchy chunk
#[derive(Clone, Debug)]
pub struct HierarchyChunk {
    /// Record of the requesting node itself (offset 0)
    pub root: NodeRecord,
    /// Descendant records in breadth-first discovery order
    pub descendants: Vec<NodeRecord>,
    /// Set when the buffer ended while records were still expected
    pub partial: bool,
}

impl HierarchyChunk {
    /// Number of records decoded including the chunk root
    pub fn record_count(&self) -> usize {
        self.descendants.len() + 1
    }
}

fn read_record(buffer: &[u8], offset: usize, name: String) -> NodeRecord {
    let bytes = &buffer[offset..offset + RECORD_SIZE];
    NodeRecord {
        name,
        child_mask: bytes[0],
        num_points: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
    }
}

/// Decode the hierarchy chunk requested by node `root_name`
///
/// A buffer too short to hold even the first record is an error. A buffer
/// that runs out while later records are still expected is tolerated: the
/// records read so far are returned with `partial` set.
pub fn decode_hierarchy(root_name: &str, buffer: &[u8]) -> Result<HierarchyChunk> {
    if buffer.len() < RECORD_SIZE {
        return Err(Error::Decode(format!(
            "chunk for {} holds {} bytes, need at least {}",
            root_name,
            buffer.len(),
            RECORD_SIZE
        )));
    }

    let root = read_record(buffer, 0, root_name.to_string());
    let mut descendants: Vec<NodeRecord> = Vec::new();
    let mut partial = false;

    // Pending records hold indices into `descendants`; `None` is the root.
    let mut pending: VecDeque<Option<usize>> = VecDeque::from([None]);
    let mut offset = RECORD_SIZE;

    'records: while let Some(entry) = pending.pop_front() {
        let (name, mask) = match entry {
            None => (root.name.clone(), root.child_mask),
            Some(i) => (descendants[i].name.clone(), descendants[i].child_mask),
        };

        for index in 0..8u8 {
            if mask & (1 << index) == 0 {
                continue;
            }
            if offset + RECORD_SIZE > buffer.len() {
                partial = true;
                break 'records;
            }

            descendants.push(read_record(buffer, offset, child_name(&name, index)));
            pending.push_back(Some(descendants.len() - 1));
            offset += RECORD_SIZE;
        }
    }

    Ok(HierarchyChunk { root, descendants, partial })
}

/// Encode records as a hierarchy chunk
///
/// `records` must already be in breadth-first order starting with the chunk
/// root. Used to write fixtures and by tooling that re-chunks a hierarchy.
pub fn encode_hierarchy<'a>(records: impl IntoIterator<Item = &'a NodeRecord>) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.push(record.child_mask);
        out.extend_from_slice(&record.num_points.to_le_bytes());
    }
    out
}
