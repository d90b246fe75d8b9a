// SPDX-License-Identifier: Apache-2.0

use crate::ident::{ClientId, IndexId, ObjectId};
use arbor_geom::{AggregateBounds, TimedMotion, TimedRotation};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Error for cache operations on untracked objects.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocError {
    /// The object is not tracked by the cache.
    #[error("object {0} is not tracked")]
    NotTracked(ObjectId),
}

/// Snapshot of a tracked object's location state.
///
/// Records are immutable once published; every update replaces the whole
/// record so readers on the worker thread see a consistent snapshot without
/// holding the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LocRecord {
    /// Time-stamped position and linear velocity.
    pub motion: TimedMotion,
    /// Time-stamped orientation and angular velocity.
    pub rotation: TimedRotation,
    /// Aggregate bounding info.
    pub bounds: AggregateBounds,
    /// Mesh reference, if any.
    pub mesh: Option<String>,
    /// Opaque physics blob, if any.
    pub physics: Option<String>,
    /// Whether this record describes a synthesized aggregate.
    pub is_aggregate: bool,
    /// Whether the object is hosted locally (vs. a replica).
    pub is_local: bool,
}

/// Observer for cache mutations.
///
/// All methods default to no-ops so installers implement only what they
/// need. Callbacks run on the writer's thread; implementations forward to
/// their own queues rather than doing work inline.
pub trait LocListener: Send + Sync {
    /// An object's motion was updated (also fired for the initial track).
    fn on_location_updated(&self, _is_local: bool, _id: ObjectId, _motion: &TimedMotion) {}

    /// An object left the cache.
    fn on_object_untracked(&self, _id: ObjectId) {}
}

/// Authoritative, lock-free-read store of object location state.
pub struct LocationCache {
    records: RwLock<HashMap<ObjectId, Arc<LocRecord>>>,
    subscriptions: Mutex<HashSet<(ClientId, ObjectId, IndexId)>>,
    listeners: RwLock<Vec<Box<dyn LocListener>>>,
}

impl LocationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        LocationCache {
            records: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Installs a mutation listener.
    pub fn add_listener(&self, listener: Box<dyn LocListener>) {
        self.listeners.write().push(listener);
    }

    /// Begins tracking `id`. Returns `false` if it was already tracked, in
    /// which case the existing record is left untouched.
    pub fn track(&self, id: ObjectId, record: LocRecord) -> bool {
        let (inserted, motion, is_local) = {
            let mut records = self.records.write();
            if records.contains_key(&id) {
                (false, record.motion, record.is_local)
            } else {
                let motion = record.motion;
                let is_local = record.is_local;
                records.insert(id, Arc::new(record));
                (true, motion, is_local)
            }
        };
        if inserted {
            trace!(%id, "tracking object");
            for l in self.listeners.read().iter() {
                l.on_location_updated(is_local, id, &motion);
            }
        }
        inserted
    }

    /// Stops tracking `id` and silently invalidates its subscriptions.
    pub fn untrack(&self, id: ObjectId) -> bool {
        let removed = self.records.write().remove(&id).is_some();
        if removed {
            self.subscriptions
                .lock()
                .retain(|(_, observed, _)| *observed != id);
            trace!(%id, "untracked object");
            for l in self.listeners.read().iter() {
                l.on_object_untracked(id);
            }
        }
        removed
    }

    /// The most recently committed snapshot for `id`.
    #[must_use]
    pub fn location(&self, id: ObjectId) -> Option<Arc<LocRecord>> {
        self.records.read().get(&id).cloned()
    }

    /// Whether `id` is currently tracked.
    #[must_use]
    pub fn tracking(&self, id: ObjectId) -> bool {
        self.records.read().contains_key(&id)
    }

    /// Number of tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Updates the motion sample for `id`.
    pub fn update_motion(&self, id: ObjectId, motion: TimedMotion) -> Result<(), LocError> {
        let is_local = self.mutate(id, |r| r.motion = motion)?;
        for l in self.listeners.read().iter() {
            l.on_location_updated(is_local, id, &motion);
        }
        Ok(())
    }

    /// Updates the orientation sample for `id`.
    pub fn update_rotation(&self, id: ObjectId, rotation: TimedRotation) -> Result<(), LocError> {
        self.mutate(id, |r| r.rotation = rotation).map(|_| ())
    }

    /// Updates the aggregate bounds for `id`.
    pub fn update_bounds(&self, id: ObjectId, bounds: AggregateBounds) -> Result<(), LocError> {
        self.mutate(id, |r| r.bounds = bounds).map(|_| ())
    }

    /// Updates the mesh reference for `id`.
    pub fn update_mesh(&self, id: ObjectId, mesh: Option<String>) -> Result<(), LocError> {
        self.mutate(id, |r| r.mesh = mesh).map(|_| ())
    }

    /// Updates the physics blob for `id`.
    pub fn update_physics(&self, id: ObjectId, physics: Option<String>) -> Result<(), LocError> {
        self.mutate(id, |r| r.physics = physics).map(|_| ())
    }

    fn mutate(
        &self,
        id: ObjectId,
        f: impl FnOnce(&mut LocRecord),
    ) -> Result<bool, LocError> {
        let mut records = self.records.write();
        let slot = records.get_mut(&id).ok_or(LocError::NotTracked(id))?;
        let mut next = (**slot).clone();
        f(&mut next);
        let is_local = next.is_local;
        *slot = Arc::new(next);
        Ok(is_local)
    }

    /// Installs a subscription; idempotent keyed by the full triple.
    /// Returns `false` if it was already present.
    pub fn add_subscription(&self, observer: ClientId, observed: ObjectId, index: IndexId) -> bool {
        self.subscriptions.lock().insert((observer, observed, index))
    }

    /// Removes a subscription. Returns `false` if it was not present.
    pub fn remove_subscription(
        &self,
        observer: ClientId,
        observed: ObjectId,
        index: IndexId,
    ) -> bool {
        self.subscriptions.lock().remove(&(observer, observed, index))
    }

    /// Drops every subscription held by `observer`, returning how many.
    pub fn remove_all_subscriptions(&self, observer: ClientId) -> usize {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|(o, _, _)| *o != observer);
        before - subs.len()
    }

    /// Whether the given subscription is installed.
    #[must_use]
    pub fn has_subscription(&self, observer: ClientId, observed: ObjectId, index: IndexId) -> bool {
        self.subscriptions.lock().contains(&(observer, observed, index))
    }

    /// Number of installed subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        LocationCache::new()
    }
}
