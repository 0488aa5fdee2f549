//! Dataset format versions and the loading strategy each one implies.
//!
//! The on-disk layout changed across format revisions:
//! - up to 1.3: point files named after the node, directly in the octree dir
//! - 1.4: same layout, point files gain a `.bin` extension and the whole
//!   hierarchy is listed in the metadata file
//! - 1.5 and later: hierarchy split into `.hrc` chunks fetched on demand,
//!   files grouped into folders by name prefix

use std::fmt;
use std::str::FromStr;

use crate::core::Error;

/// Format version, ordered by (major, minor)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// First version with a `.bin` extension on point files
    pub const BIN_EXTENSION: Version = Version::new(1, 4);

    /// First version with on-demand hierarchy chunks
    pub const HIERARCHY_CHUNKS: Version = Version::new(1, 5);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// `self >= other`
    pub fn at_least(&self, other: Version) -> bool {
        *self >= other
    }

    /// `self <= other`
    pub fn up_to(&self, other: Version) -> bool {
        *self <= other
    }

    /// Whether hierarchy chunks are fetched lazily per step
    pub fn hierarchy_on_demand(&self) -> bool {
        self.at_least(Self::HIERARCHY_CHUNKS)
    }

    /// Whether point files carry a `.bin` extension
    pub fn has_bin_extension(&self) -> bool {
        self.at_least(Self::BIN_EXTENSION)
    }

    /// Whether the metadata file lists the complete hierarchy
    pub fn flat_hierarchy_in_metadata(&self) -> bool {
        !self.hierarchy_on_demand()
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Parse `"<major>.<minor>"`; a missing minor part means 0.
    ///
    /// Only the leading digits after the first dot form the minor number, so
    /// `"1.5.2"` reads as 1.5.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::InvalidVersion(s.to_string());
        let (major, rest) = s.split_once('.').unwrap_or((s, ""));

        let major = major.parse::<u32>().map_err(|_| invalid())?;
        let minor_digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .map_or(rest, |end| &rest[..end]);
        let minor = match (minor_digits.is_empty(), rest.is_empty()) {
            (_, true) => 0,
            (true, false) => return Err(invalid()),
            (false, false) => minor_digits.parse::<u32>().map_err(|_| invalid())?,
        };

        Ok(Version::new(major, minor))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
