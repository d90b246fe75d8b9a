use crate::sphere::BoundingSphere;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Aggregate bounding info: a node that bounds a set of leaves.
///
/// `center_offset` is the centroid offset from the node's own position,
/// `center_bounds_radius` the radius of the ball containing all child
/// centers, and `max_object_radius` the radius of the largest enclosed
/// child. An exact leaf bound is the degenerate case `(0, 0, r_leaf)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateBounds {
    /// Centroid offset from the owning object's position.
    pub center_offset: Vec3,
    /// Radius of the ball containing all child centers. Never negative.
    pub center_bounds_radius: f32,
    /// Radius of the largest enclosed child. Never negative.
    pub max_object_radius: f32,
}

impl AggregateBounds {
    /// The degenerate bound of a single leaf object of radius `r_leaf`.
    #[must_use]
    pub fn exact(r_leaf: f32) -> Self {
        AggregateBounds {
            center_offset: Vec3::ZERO,
            center_bounds_radius: 0.0,
            max_object_radius: r_leaf.max(0.0),
        }
    }

    /// Builds a bound, clamping negative radii to zero.
    #[must_use]
    pub fn new(center_offset: Vec3, center_bounds_radius: f32, max_object_radius: f32) -> Self {
        AggregateBounds {
            center_offset,
            center_bounds_radius: center_bounds_radius.max(0.0),
            max_object_radius: max_object_radius.max(0.0),
        }
    }

    /// Conservative radius of the whole aggregate.
    #[must_use]
    pub fn full_radius(&self) -> f32 {
        self.center_bounds_radius + self.max_object_radius
    }

    /// The world-space sphere for an object positioned at `position`.
    #[must_use]
    pub fn world_sphere(&self, position: Vec3) -> BoundingSphere {
        BoundingSphere::new(position + self.center_offset, self.full_radius())
    }
}

impl Default for AggregateBounds {
    fn default() -> Self {
        AggregateBounds::exact(0.0)
    }
}
