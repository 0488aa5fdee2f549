//! Bounding sphere

use crate::core::types::DVec3;

/// Sphere defined by center and radius
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }
}
