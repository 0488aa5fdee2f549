//! Axis-aligned bounding box

use crate::core::types::DVec3;
use crate::math::Sphere;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Get center point
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    /// Return the box shifted by `offset`
    pub fn translated(&self, offset: DVec3) -> Aabb {
        Aabb::new(self.min + offset, self.max + offset)
    }

    /// Smallest sphere centred on the box that encloses it
    pub fn bounding_sphere(&self) -> Sphere {
        Sphere::new(self.center(), self.size().length() * 0.5)
    }

    /// Get the AABB of child octant `index` (0-7)
    ///
    /// Each axis is bisected; bit 0 of `index` picks the X half, bit 1 the Y
    /// half and bit 2 the Z half (0 = low, 1 = high). This is the ordering the
    /// binary hierarchy chunks are written in.
    pub fn child_octant(&self, index: u8) -> Aabb {
        debug_assert!(index < 8, "octant index out of range: {index}");

        let center = self.center();

        let min = DVec3::new(
            if index & 1 != 0 { center.x } else { self.min.x },
            if index & 2 != 0 { center.y } else { self.min.y },
            if index & 4 != 0 { center.z } else { self.min.z },
        );
        let max = DVec3::new(
            if index & 1 != 0 { self.max.x } else { center.x },
            if index & 2 != 0 { self.max.y } else { center.y },
            if index & 4 != 0 { self.max.z } else { center.z },
        );

        Aabb { min, max }
    }
}
