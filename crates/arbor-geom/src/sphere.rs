use glam::Vec3;
use serde::{Deserialize, Serialize};

/// A bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingSphere {
    /// Center of the sphere.
    pub center: Vec3,
    /// Radius, never negative.
    pub radius: f32,
}

impl BoundingSphere {
    /// Builds a sphere, clamping negative radii to zero.
    #[must_use]
    pub fn new(center: Vec3, radius: f32) -> Self {
        BoundingSphere {
            center,
            radius: radius.max(0.0),
        }
    }

    /// A degenerate sphere at the origin.
    #[must_use]
    pub fn zero() -> Self {
        BoundingSphere {
            center: Vec3::ZERO,
            radius: 0.0,
        }
    }

    /// Whether `other` lies entirely within this sphere.
    #[must_use]
    pub fn contains(&self, other: &BoundingSphere) -> bool {
        self.center.distance(other.center) + other.radius <= self.radius + 1e-5
    }

    /// The smallest sphere enclosing both `self` and `other`.
    #[must_use]
    pub fn merge(&self, other: &BoundingSphere) -> BoundingSphere {
        let d = self.center.distance(other.center);
        if d + other.radius <= self.radius {
            return *self;
        }
        if d + self.radius <= other.radius {
            return *other;
        }
        let radius = (d + self.radius + other.radius) * 0.5;
        // Center sits on the segment between the two centers, pushed toward
        // the larger sphere.
        let t = if d > 0.0 {
            (radius - self.radius) / d
        } else {
            0.0
        };
        BoundingSphere {
            center: self.center.lerp(other.center, t),
            radius,
        }
    }

    /// How much this sphere's radius must grow to enclose `other`.
    #[must_use]
    pub fn enlargement(&self, other: &BoundingSphere) -> f32 {
        (self.merge(other).radius - self.radius).max(0.0)
    }

    /// Approximate equality, for refit short-circuiting.
    #[must_use]
    pub fn nearly_equal(&self, other: &BoundingSphere) -> bool {
        self.center.distance_squared(other.center) < 1e-8 && (self.radius - other.radius).abs() < 1e-4
    }
}
