// SPDX-License-Identifier: Apache-2.0

use crate::tree::{BvhTree, NodeIdx};
use std::collections::HashSet;

/// A query's frontier over the tree.
///
/// Every tracked object has exactly one ancestor on the frontier (or the
/// cut is empty and covers nothing). No two members may ever be in an
/// ancestor/descendant relation; the handler maintains that invariant
/// across refine, coarsen, and structural churn.
#[derive(Debug, Default)]
pub(crate) struct Cut {
    members: HashSet<NodeIdx>,
    /// Set once the tree root has been announced to this query. Reset when
    /// the root collapses so the next root gets a fresh announcement.
    seeded: bool,
}

impl Cut {
    pub fn contains(&self, idx: NodeIdx) -> bool {
        self.members.contains(&idx)
    }

    pub fn insert(&mut self, idx: NodeIdx) -> bool {
        self.members.insert(idx)
    }

    pub fn remove(&mut self, idx: NodeIdx) -> bool {
        self.members.remove(&idx)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn seeded(&self) -> bool {
        self.seeded
    }

    pub fn mark_seeded(&mut self) {
        self.seeded = true;
    }

    pub fn reset(&mut self) {
        self.members.clear();
        self.seeded = false;
    }

    pub fn members(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.members.iter().copied()
    }

    /// Whether `leaf` (or one of its ancestors) is on the cut.
    pub fn covers(&self, tree: &BvhTree, leaf: NodeIdx) -> bool {
        let mut cur = Some(leaf);
        while let Some(idx) = cur {
            if self.members.contains(&idx) {
                return true;
            }
            cur = tree.parent_of(idx);
        }
        false
    }

    /// Debug check of the frontier invariant: no member is an ancestor of
    /// another member.
    #[cfg(test)]
    pub fn check_invariant(&self, tree: &BvhTree) -> bool {
        for &a in &self.members {
            for &b in &self.members {
                if a != b && tree.is_self_or_ancestor(a, b) {
                    return false;
                }
            }
        }
        true
    }
}
