//! Bounding volumes used by the octree

pub mod aabb;
pub mod sphere;

pub use aabb::Aabb;
pub use sphere::Sphere;
