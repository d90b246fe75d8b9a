#![deny(
    warnings,
    clippy::all,
    clippy::pedantic,
    rust_2018_idioms,
    missing_docs,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![doc = r"Geometric and temporal primitives for the arbor space server.

This crate provides:
- Bounding spheres (`BoundingSphere`) and aggregate bounding info
  (`AggregateBounds`).
- Time-stamped motion values (`TimedMotion`, `TimedRotation`) that can be
  extrapolated to a later simulation time.
- Simulation time (`SimTime`), a microsecond count since server start.

Design notes:
- Float32 throughout; operations favor clarity and reproducibility.
- No ambient clock; callers supply `SimTime` explicitly so everything here
  is testable without timers.
"]

/// Aggregate bounding info for tree nodes and leaves.
pub mod bounds;
/// Time-stamped motion and rotation values.
pub mod motion;
/// Bounding spheres.
pub mod sphere;
/// Simulation time.
pub mod time;

pub use bounds::AggregateBounds;
pub use motion::{TimedMotion, TimedRotation};
pub use sphere::BoundingSphere;
pub use time::SimTime;
