//! Node names: a root marker followed by one octal digit per tree level.
//!
//! `"r"` is the root, `"r3"` its child in octant 3, `"r35"` that node's child
//! in octant 5, and so on. The digit at byte offset `k + 1` selects the child
//! slot at depth `k + 1`.

use crate::core::{Error, Result};

/// Root marker character
pub const ROOT_MARKER: char = 'r';

/// Name of the root node
pub const ROOT_NAME: &str = "r";

/// Byte offset of the first octal digit in a name
pub const DIGITS_OFFSET: usize = ROOT_MARKER.len_utf8();

/// Check that `name` is a root marker followed only by octal digits
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    if chars.next() != Some(ROOT_MARKER) {
        return Err(Error::InvalidName(name.to_string()));
    }
    if !chars.all(|c| ('0'..='7').contains(&c)) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Child index (0-7) of a node within its parent
///
/// This is the numeric value of the last digit. The root has no digit and
/// yields 0. `name` must not be empty.
pub fn index_from_name(name: &str) -> u8 {
    debug_assert!(!name.is_empty(), "node names are never empty");

    name.as_bytes()
        .last()
        .map(|b| b.wrapping_sub(b'0'))
        .filter(|digit| *digit < 8)
        .unwrap_or(0)
}

/// Tree depth of a node (0 for the root)
pub fn level_from_name(name: &str) -> u32 {
    name.len().saturating_sub(DIGITS_OFFSET) as u32
}

/// The octal digits of a name, without the root marker
pub fn digits(name: &str) -> &str {
    name.get(DIGITS_OFFSET..).unwrap_or("")
}

/// Name of the parent node, or `None` for the root
pub fn parent_name(name: &str) -> Option<&str> {
    if name.len() <= DIGITS_OFFSET {
        return None;
    }
    Some(&name[..name.len() - 1])
}

/// Name of child `index` of `parent`
pub fn child_name(parent: &str, index: u8) -> String {
    debug_assert!(index < 8, "child index out of range: {index}");

    let mut name = String::with_capacity(parent.len() + 1);
    name.push_str(parent);
    name.push(char::from(b'0' + index));
    name
}
