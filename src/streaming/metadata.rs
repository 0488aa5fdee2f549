//! Dataset metadata (`cloud.js`)
//!
//! The metadata file names the format version, where the octree files live,
//! the dataset bounds and base point spacing. Older datasets (up to 1.4) also
//! list every node of the hierarchy as `[name, numPoints]` pairs.

use serde::{Deserialize, Serialize};

use crate::core::types::DVec3;
use crate::core::{Error, Result};
use crate::math::Aabb;
use crate::octree::geometry::GeometrySettings;
use crate::octree::Version;
use crate::streaming::StreamingConfig;

/// Bounds as written in the metadata file
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxExtent {
    pub lx: f64,
    pub ly: f64,
    pub lz: f64,
    pub ux: f64,
    pub uy: f64,
    pub uz: f64,
}

impl BoxExtent {
    pub fn to_aabb(&self) -> Aabb {
        Aabb::new(
            DVec3::new(self.lx, self.ly, self.lz),
            DVec3::new(self.ux, self.uy, self.uz),
        )
    }
}

/// Parsed `cloud.js`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMetadata {
    pub version: String,
    pub octree_dir: String,
    #[serde(default)]
    pub projection: String,
    #[serde(default)]
    pub points: u64,
    pub bounding_box: BoxExtent,
    #[serde(default)]
    pub tight_bounding_box: Option<BoxExtent>,
    /// Attribute layout of point files; interpreted by payload decoders
    #[serde(default)]
    pub point_attributes: serde_json::Value,
    pub spacing: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub hierarchy_step_size: Option<u32>,
    #[serde(default)]
    pub hierarchy: Vec<(String, u32)>,
}

fn default_scale() -> f64 {
    0.01
}

impl CloudMetadata {
    /// Parse metadata from the raw file contents
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn parsed_version(&self) -> Result<Version> {
        self.version.parse()
    }

    /// Point count of the root as listed in a flat hierarchy
    pub fn root_num_points(&self) -> Option<u32> {
        self.hierarchy
            .iter()
            .find(|(name, _)| name == crate::octree::name::ROOT_NAME)
            .map(|(_, num_points)| *num_points)
    }

    /// Tree layout for a dataset whose metadata sits in `base_dir`
    ///
    /// Coordinates are shifted so the bounding box starts at the origin; the
    /// shift is kept as `offset`. The octree dir is resolved against
    /// `base_dir`.
    pub fn settings(&self, base_dir: &str, config: &StreamingConfig) -> Result<GeometrySettings> {
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return Err(Error::Metadata(format!("invalid spacing {}", self.spacing)));
        }

        let bounds = self.bounding_box.to_aabb();
        if !bounds.min.cmple(bounds.max).all() {
            return Err(Error::Metadata("bounding box min exceeds max".into()));
        }

        let hierarchy_step_size = self
            .hierarchy_step_size
            .unwrap_or(config.default_hierarchy_step_size);
        if hierarchy_step_size == 0 {
            return Err(Error::Metadata("hierarchyStepSize must be at least 1".into()));
        }

        let offset = bounds.min;
        let tight = self.tight_bounding_box.map(|b| b.to_aabb()).unwrap_or(bounds);

        let octree_dir = if base_dir.is_empty() {
            self.octree_dir.clone()
        } else {
            format!("{}/{}", base_dir.trim_end_matches('/'), self.octree_dir)
        };

        Ok(GeometrySettings {
            octree_dir,
            spacing: self.spacing,
            hierarchy_step_size,
            bounding_box: bounds.translated(-offset),
            tight_bounding_box: tight.translated(-offset),
            offset,
        })
    }
}

/// Directory part of a metadata URL (everything before the last `/`)
pub fn base_dir_of(url: &str) -> &str {
    url.rfind('/').map(|i| &url[..i]).unwrap_or("")
}
