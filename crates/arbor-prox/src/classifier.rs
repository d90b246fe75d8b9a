// SPDX-License-Identifier: Apache-2.0

use arbor_geom::SimTime;
use arbor_loc::ObjectId;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Tracks objects that have stopped moving and, after a dwell delay, should
/// migrate to the static index.
///
/// Entries are indexed both by id (for cancellation when the object speeds
/// up or disconnects) and by expiration (for cheap expiry scans). The dwell
/// delay keeps short stops from bouncing objects between trees.
pub struct Classifier {
    dwell: Duration,
    by_id: HashMap<ObjectId, (SimTime, bool)>,
    by_expiry: BTreeSet<(SimTime, ObjectId)>,
}

impl Classifier {
    /// Creates a classifier with the given dwell delay.
    #[must_use]
    pub fn new(dwell: Duration) -> Self {
        Classifier {
            dwell,
            by_id: HashMap::new(),
            by_expiry: BTreeSet::new(),
        }
    }

    /// Schedules a move-to-static timeout at `now + dwell`. An existing
    /// entry is kept: the dwell clock starts when the object first went
    /// quiet, not at every subsequent slow sample.
    pub fn schedule(&mut self, id: ObjectId, is_local: bool, now: SimTime) {
        if self.by_id.contains_key(&id) {
            return;
        }
        let expires = now + self.dwell;
        self.by_id.insert(id, (expires, is_local));
        self.by_expiry.insert((expires, id));
    }

    /// Cancels a pending timeout. Returns whether one existed.
    pub fn cancel(&mut self, id: ObjectId) -> bool {
        match self.by_id.remove(&id) {
            Some((expires, _)) => {
                self.by_expiry.remove(&(expires, id));
                true
            }
            None => false,
        }
    }

    /// Whether a timeout is pending for `id`.
    #[must_use]
    pub fn pending(&self, id: ObjectId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Pops every record with `expiration <= now`, in expiry order.
    pub fn pop_expired(&mut self, now: SimTime) -> Vec<(ObjectId, bool)> {
        let mut out = Vec::new();
        while let Some(&(expires, id)) = self.by_expiry.iter().next() {
            if expires > now {
                break;
            }
            self.by_expiry.remove(&(expires, id));
            if let Some((_, is_local)) = self.by_id.remove(&id) {
                out.push((id, is_local));
            }
        }
        out
    }

    /// Number of pending timeouts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no timeouts are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: u64) -> SimTime {
        SimTime::from_micros(ms * 1_000)
    }

    #[test]
    fn expiry_pops_in_order_and_only_when_due() {
        let mut c = Classifier::new(Duration::from_millis(100));
        let a = ObjectId::random();
        let b = ObjectId::random();
        c.schedule(a, true, t(0));
        c.schedule(b, true, t(50));

        assert!(c.pop_expired(t(99)).is_empty());
        let first = c.pop_expired(t(100));
        assert_eq!(first, vec![(a, true)]);
        let second = c.pop_expired(t(1_000));
        assert_eq!(second, vec![(b, true)]);
        assert!(c.is_empty());
    }

    #[test]
    fn reschedule_keeps_the_original_deadline() {
        let mut c = Classifier::new(Duration::from_millis(100));
        let a = ObjectId::random();
        c.schedule(a, true, t(0));
        c.schedule(a, true, t(90));
        assert_eq!(c.pop_expired(t(100)).len(), 1);
    }

    #[test]
    fn cancel_removes_both_indexes() {
        let mut c = Classifier::new(Duration::from_millis(10));
        let a = ObjectId::random();
        c.schedule(a, false, t(0));
        assert!(c.cancel(a));
        assert!(!c.cancel(a));
        assert!(c.pop_expired(t(1_000)).is_empty());
    }
}
