//! Point file and hierarchy chunk locations.
//!
//! Paths are functions of `(octree_dir, version, name, hierarchy_step_size)`
//! only. Any base URL prefixing is applied later by the dataset loader.

use super::name::{digits, ROOT_NAME};
use super::version::Version;

/// Folder holding a node's files, relative to the octree dir
///
/// The node's digits are cut into groups of `step` and every complete group
/// becomes one path segment below `r`. With a step of 2, `r0123` lives in
/// `r/01/23` and `r012` in `r/01`.
pub fn hierarchy_base_path(name: &str, step: u32) -> String {
    let mut path = String::from(ROOT_NAME);
    if step == 0 {
        return path;
    }

    let digits: Vec<char> = digits(name).chars().collect();
    for group in digits.chunks_exact(step as usize) {
        path.push('/');
        path.extend(group);
    }
    path
}

/// Path of a node's point file without any extension
pub fn node_path(octree_dir: &str, version: Version, name: &str, step: u32) -> String {
    if version.hierarchy_on_demand() {
        format!("{}/{}/{}", octree_dir, hierarchy_base_path(name, step), name)
    } else {
        format!("{}/{}", octree_dir, name)
    }
}

/// Full path of a node's point payload file
pub fn point_url(octree_dir: &str, version: Version, name: &str, step: u32) -> String {
    let path = node_path(octree_dir, version, name, step);
    if version.has_bin_extension() {
        format!("{}.bin", path)
    } else {
        path
    }
}

/// Full path of the hierarchy chunk rooted at `name`
pub fn hierarchy_url(octree_dir: &str, name: &str, step: u32) -> String {
    format!("{}/{}/{}.hrc", octree_dir, hierarchy_base_path(name, step), name)
}
