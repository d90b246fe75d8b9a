// SPDX-License-Identifier: Apache-2.0

//! Aggregate listener seam.
//!
//! Tree maintenance synthesizes aggregate nodes; downstream layers (the
//! location mirror, mesh generation) learn about them through this trait
//! without the engine coupling to any of that machinery. All methods
//! default to no-ops so implementations pick the events they care about.

use arbor_geom::BoundingSphere;
use arbor_loc::{IndexId, ObjectId};

/// Observer for aggregate node lifecycle inside a query handler.
///
/// Callbacks run on the proximity worker thread, inside tree maintenance;
/// implementations must hand work off rather than re-entering the engine.
pub trait AggregateListener: Send {
    /// A fresh aggregate node was created.
    fn aggregate_created(&self, _index: IndexId, _id: ObjectId) {}

    /// A child was attached beneath an aggregate.
    fn aggregate_child_added(
        &self,
        _index: IndexId,
        _id: ObjectId,
        _child: ObjectId,
        _bounds: BoundingSphere,
    ) {
    }

    /// A child was detached from an aggregate.
    fn aggregate_child_removed(
        &self,
        _index: IndexId,
        _id: ObjectId,
        _child: ObjectId,
        _bounds: BoundingSphere,
    ) {
    }

    /// An aggregate's bounding sphere changed.
    fn aggregate_bounds_updated(&self, _index: IndexId, _id: ObjectId, _bounds: BoundingSphere) {}

    /// An aggregate collapsed and was destroyed.
    fn aggregate_destroyed(&self, _index: IndexId, _id: ObjectId) {}

    /// The number of query cuts passing through an aggregate changed.
    fn aggregate_observed(&self, _index: IndexId, _id: ObjectId, _nobservers: u32) {}
}

/// Discards all aggregate events. The default when nothing is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAggregateListener;

impl AggregateListener for NullAggregateListener {}
