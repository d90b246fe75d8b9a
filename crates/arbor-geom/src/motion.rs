use crate::time::SimTime;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// A position sample plus linear velocity, valid from `t` onward.
///
/// The stored position is exact at `t`; [`TimedMotion::position_at`]
/// extrapolates linearly for later times. Updating replaces both the value
/// and its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedMotion {
    /// Sample time.
    pub t: SimTime,
    /// Position at `t`.
    pub position: Vec3,
    /// Linear velocity, units per second.
    pub velocity: Vec3,
}

impl TimedMotion {
    /// A stationary sample at `position`.
    #[must_use]
    pub fn stationary(t: SimTime, position: Vec3) -> Self {
        TimedMotion {
            t,
            position,
            velocity: Vec3::ZERO,
        }
    }

    /// Extrapolated position at `now`.
    #[must_use]
    pub fn position_at(&self, now: SimTime) -> Vec3 {
        self.position + self.velocity * now.since(self.t).as_secs_f32()
    }

    /// Speed of the sample, units per second.
    #[must_use]
    pub fn speed(&self) -> f32 {
        self.velocity.length()
    }
}

/// An orientation sample plus angular velocity, valid from `t` onward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedRotation {
    /// Sample time.
    pub t: SimTime,
    /// Orientation at `t`.
    pub orientation: Quat,
    /// Angular velocity as a scaled rotation axis, radians per second.
    pub angular_velocity: Vec3,
}

impl TimedRotation {
    /// An identity orientation with no spin.
    #[must_use]
    pub fn identity(t: SimTime) -> Self {
        TimedRotation {
            t,
            orientation: Quat::IDENTITY,
            angular_velocity: Vec3::ZERO,
        }
    }

    /// Extrapolated orientation at `now`.
    #[must_use]
    pub fn orientation_at(&self, now: SimTime) -> Quat {
        let dt = now.since(self.t).as_secs_f32();
        if dt == 0.0 || self.angular_velocity == Vec3::ZERO {
            return self.orientation;
        }
        (Quat::from_scaled_axis(self.angular_velocity * dt) * self.orientation).normalize()
    }
}
