// SPDX-License-Identifier: Apache-2.0

use arbor_geom::BoundingSphere;
use arbor_loc::{IndexId, ObjectId};
use std::collections::HashMap;

/// Arena index of a tree node. Stable for the node's lifetime; slots are
/// recycled only after every cut referencing them has been purged.
pub(crate) type NodeIdx = usize;

#[derive(Debug)]
pub(crate) enum NodeKind {
    Leaf,
    Internal { children: Vec<NodeIdx> },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub uuid: ObjectId,
    pub parent: Option<NodeIdx>,
    pub kind: NodeKind,
    pub bounds: BoundingSphere,
    /// Number of query cuts currently passing through this node.
    pub cuts: u32,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }
}

/// Result of inserting a leaf.
pub(crate) struct InsertOutcome {
    pub leaf: NodeIdx,
    /// Set when the insert created the tree's root.
    pub created_root: Option<NodeIdx>,
    /// Set when the insert split a node into a fresh child aggregate.
    pub new_aggregate: Option<NodeIdx>,
    /// Internal nodes whose bounds changed, bottom-up.
    pub refit_changed: Vec<NodeIdx>,
}

/// Result of removing a leaf.
pub(crate) struct RemoveOutcome {
    /// Removed nodes, leaf first, then collapsed empty ancestors bottom-up.
    /// Indices are already freed; they are only valid for cut purging.
    pub removed: Vec<(NodeIdx, ObjectId, bool)>,
    pub root_destroyed: bool,
    /// Surviving internal nodes whose bounds changed, bottom-up.
    pub refit_changed: Vec<NodeIdx>,
}

/// A bounding-volume tree over world objects.
///
/// Leaves are objects; internal nodes are synthesized aggregates with
/// UUIDs of their own. Parent/child links are arena indices, which keeps
/// back-pointers cheap and cycle-free. Nodes whose fan-out exceeds the
/// branching bound split *downward*: a fresh child aggregate absorbs a
/// partition of the children, so the split node keeps its identity and its
/// coverage and cuts through or below it stay valid.
pub(crate) struct BvhTree {
    slots: Vec<Option<Node>>,
    free: Vec<NodeIdx>,
    root: Option<NodeIdx>,
    by_uuid: HashMap<ObjectId, NodeIdx>,
    branching: usize,
    index_id: IndexId,
    aggregate_seq: u64,
    num_leaves: usize,
}

impl BvhTree {
    pub fn new(branching: usize, index_id: IndexId) -> Self {
        BvhTree {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            by_uuid: HashMap::new(),
            branching: branching.max(2),
            index_id,
            aggregate_seq: 0,
            num_leaves: 0,
        }
    }

    pub fn root(&self) -> Option<NodeIdx> {
        self.root
    }

    #[allow(clippy::expect_used)]
    pub fn node(&self, idx: NodeIdx) -> &Node {
        self.slots[idx].as_ref().expect("vacant tree slot")
    }

    #[allow(clippy::expect_used)]
    fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        self.slots[idx].as_mut().expect("vacant tree slot")
    }

    pub fn lookup(&self, uuid: ObjectId) -> Option<NodeIdx> {
        self.by_uuid.get(&uuid).copied()
    }

    pub fn uuid_of(&self, idx: NodeIdx) -> ObjectId {
        self.node(idx).uuid
    }

    pub fn parent_of(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.node(idx).parent
    }

    pub fn children_of(&self, idx: NodeIdx) -> Option<&[NodeIdx]> {
        match &self.node(idx).kind {
            NodeKind::Leaf => None,
            NodeKind::Internal { children } => Some(children),
        }
    }

    pub fn contains_leaf(&self, uuid: ObjectId) -> bool {
        self.lookup(uuid).is_some_and(|idx| self.node(idx).is_leaf())
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    pub fn num_nodes(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Increments the cut refcount, returning the new count.
    pub fn inc_cut(&mut self, idx: NodeIdx) -> u32 {
        let n = self.node_mut(idx);
        n.cuts += 1;
        n.cuts
    }

    /// Decrements the cut refcount, returning the new count.
    pub fn dec_cut(&mut self, idx: NodeIdx) -> u32 {
        let n = self.node_mut(idx);
        n.cuts = n.cuts.saturating_sub(1);
        n.cuts
    }

    /// Iterates all live nodes as `(uuid, parent_uuid, bounds, cuts)`.
    pub fn iter_nodes(
        &self,
    ) -> impl Iterator<Item = (ObjectId, Option<ObjectId>, BoundingSphere, u32)> + '_ {
        self.slots.iter().filter_map(move |slot| {
            let n = slot.as_ref()?;
            let parent = n.parent.map(|p| self.uuid_of(p));
            Some((n.uuid, parent, n.bounds, n.cuts))
        })
    }

    fn alloc(&mut self, node: Node) -> NodeIdx {
        let uuid = node.uuid;
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };
        self.by_uuid.insert(uuid, idx);
        idx
    }

    fn dealloc(&mut self, idx: NodeIdx) {
        if let Some(node) = self.slots[idx].take() {
            self.by_uuid.remove(&node.uuid);
            self.free.push(idx);
        }
    }

    fn mint_aggregate_uuid(&mut self) -> ObjectId {
        self.aggregate_seq += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"aggregate:");
        hasher.update(&self.index_id.0.to_le_bytes());
        hasher.update(&self.aggregate_seq.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        ObjectId::from_bytes(bytes)
    }

    /// Inserts a leaf for `object`. The object must not already be present.
    pub fn insert(&mut self, object: ObjectId, sphere: BoundingSphere) -> InsertOutcome {
        assert!(
            !self.by_uuid.contains_key(&object),
            "duplicate insert of object {object}"
        );
        let leaf = self.alloc(Node {
            uuid: object,
            parent: None,
            kind: NodeKind::Leaf,
            bounds: sphere,
            cuts: 0,
        });
        self.num_leaves += 1;

        let Some(root) = self.root else {
            let agg_uuid = self.mint_aggregate_uuid();
            let root_idx = self.alloc(Node {
                uuid: agg_uuid,
                parent: None,
                kind: NodeKind::Internal {
                    children: vec![leaf],
                },
                bounds: sphere,
                cuts: 0,
            });
            self.node_mut(leaf).parent = Some(root_idx);
            self.root = Some(root_idx);
            return InsertOutcome {
                leaf,
                created_root: Some(root_idx),
                new_aggregate: None,
                refit_changed: Vec::new(),
            };
        };

        let target = self.descend(root, &sphere);
        self.node_mut(leaf).parent = Some(target);
        match &mut self.node_mut(target).kind {
            NodeKind::Internal { children } => children.push(leaf),
            NodeKind::Leaf => unreachable!("descend always lands on an internal node"),
        }

        let new_aggregate = if self
            .children_of(target)
            .is_some_and(|c| c.len() > self.branching)
        {
            Some(self.split(target))
        } else {
            None
        };
        let refit_changed = self.refit_up(target);

        InsertOutcome {
            leaf,
            created_root: None,
            new_aggregate,
            refit_changed,
        }
    }

    /// Picks the internal node a new leaf with `sphere` should attach to:
    /// descend by least bounding-sphere enlargement until the best child is
    /// a leaf.
    fn descend(&self, from: NodeIdx, sphere: &BoundingSphere) -> NodeIdx {
        let mut current = from;
        loop {
            let Some(children) = self.children_of(current) else {
                unreachable!("descend entered a leaf");
            };
            let best = children
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    let ea = self.node(a).bounds.enlargement(sphere);
                    let eb = self.node(b).bounds.enlargement(sphere);
                    ea.partial_cmp(&eb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| {
                            self.node(a)
                                .bounds
                                .radius
                                .partial_cmp(&self.node(b).bounds.radius)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                });
            match best {
                Some(child) if !self.node(child).is_leaf() => current = child,
                _ => return current,
            }
        }
    }

    /// Splits an over-full node by moving a partition of its children under
    /// a fresh child aggregate. Returns the new aggregate's index.
    fn split(&mut self, target: NodeIdx) -> NodeIdx {
        let children = match &self.node(target).kind {
            NodeKind::Internal { children } => children.clone(),
            NodeKind::Leaf => unreachable!("split of a leaf"),
        };

        // Quadratic-style seeds: the two children farthest apart.
        let (mut seed_a, mut seed_b, mut best) = (children[0], children[1], -1.0f32);
        for (i, &a) in children.iter().enumerate() {
            for &b in children.iter().skip(i + 1) {
                let d = self.node(a).bounds.center.distance(self.node(b).bounds.center);
                if d > best {
                    best = d;
                    seed_a = a;
                    seed_b = b;
                }
            }
        }

        let mut keep = Vec::new();
        let mut moved = Vec::new();
        for &c in &children {
            if c == seed_a {
                keep.push(c);
            } else if c == seed_b {
                moved.push(c);
            } else {
                let da = self.node(c).bounds.center.distance(self.node(seed_a).bounds.center);
                let db = self.node(c).bounds.center.distance(self.node(seed_b).bounds.center);
                if db < da {
                    moved.push(c);
                } else {
                    keep.push(c);
                }
            }
        }

        let mut bounds = self.node(moved[0]).bounds;
        for &c in &moved[1..] {
            bounds = bounds.merge(&self.node(c).bounds);
        }
        let agg_uuid = self.mint_aggregate_uuid();
        let agg = self.alloc(Node {
            uuid: agg_uuid,
            parent: Some(target),
            kind: NodeKind::Internal {
                children: moved.clone(),
            },
            bounds,
            cuts: 0,
        });
        for &c in &moved {
            self.node_mut(c).parent = Some(agg);
        }
        keep.push(agg);
        match &mut self.node_mut(target).kind {
            NodeKind::Internal { children } => *children = keep,
            NodeKind::Leaf => unreachable!(),
        }
        agg
    }

    /// Recomputes internal bounds from `start` up, stopping at the first
    /// node whose sphere does not change. Returns the changed nodes.
    fn refit_up(&mut self, start: NodeIdx) -> Vec<NodeIdx> {
        let mut changed = Vec::new();
        let mut cur = Some(start);
        while let Some(idx) = cur {
            let children = match self.children_of(idx) {
                Some(c) => c.to_vec(),
                None => break,
            };
            let mut bounds = self.node(children[0]).bounds;
            for &c in &children[1..] {
                bounds = bounds.merge(&self.node(c).bounds);
            }
            if bounds.nearly_equal(&self.node(idx).bounds) {
                break;
            }
            self.node_mut(idx).bounds = bounds;
            changed.push(idx);
            cur = self.node(idx).parent;
        }
        changed
    }

    /// Removes the leaf for `object`, collapsing ancestors that become
    /// empty. Returns `None` when the object is unknown.
    pub fn remove(&mut self, object: ObjectId) -> Option<RemoveOutcome> {
        let leaf = self.lookup(object)?;
        if !self.node(leaf).is_leaf() {
            return None;
        }
        let mut removed = vec![(leaf, object, true)];
        let mut parent = self.node(leaf).parent;
        self.dealloc(leaf);
        self.num_leaves -= 1;

        let mut root_destroyed = false;
        let mut refit_changed = Vec::new();
        let mut child = leaf;
        while let Some(p) = parent {
            match &mut self.node_mut(p).kind {
                NodeKind::Internal { children } => children.retain(|&c| c != child),
                NodeKind::Leaf => unreachable!("leaf as parent"),
            }
            if self.children_of(p).is_some_and(<[NodeIdx]>::is_empty) {
                removed.push((p, self.uuid_of(p), false));
                let next = self.node(p).parent;
                if self.root == Some(p) {
                    self.root = None;
                    root_destroyed = true;
                }
                self.dealloc(p);
                child = p;
                parent = next;
            } else {
                refit_changed = self.refit_up(p);
                break;
            }
        }

        Some(RemoveOutcome {
            removed,
            root_destroyed,
            refit_changed,
        })
    }

    /// Updates a leaf's bounding sphere and refits its ancestors. Returns
    /// the changed internal nodes, or `None` for an unknown object.
    pub fn update_leaf(&mut self, object: ObjectId, sphere: BoundingSphere) -> Option<Vec<NodeIdx>> {
        let leaf = self.lookup(object)?;
        if !self.node(leaf).is_leaf() {
            return None;
        }
        self.node_mut(leaf).bounds = sphere;
        let parent = self.node(leaf).parent?;
        Some(self.refit_up(parent))
    }

    /// Whether `ancestor` lies on the path from `idx` (inclusive) to the
    /// root.
    #[cfg(test)]
    pub fn is_self_or_ancestor(&self, ancestor: NodeIdx, idx: NodeIdx) -> bool {
        let mut cur = Some(idx);
        while let Some(i) = cur {
            if i == ancestor {
                return true;
            }
            cur = self.node(i).parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn sphere(x: f32, r: f32) -> BoundingSphere {
        BoundingSphere::new(Vec3::new(x, 0.0, 0.0), r)
    }

    fn tree() -> BvhTree {
        BvhTree::new(4, IndexId(0))
    }

    #[test]
    fn first_insert_creates_an_aggregate_root() {
        let mut t = tree();
        let o = ObjectId::random();
        let out = t.insert(o, sphere(0.0, 1.0));
        let root = out.created_root.unwrap();
        assert_eq!(t.root(), Some(root));
        assert!(!t.node(root).is_leaf());
        assert_eq!(t.children_of(root).unwrap(), &[out.leaf]);
        assert_eq!(t.num_leaves(), 1);
        assert_eq!(t.num_nodes(), 2);
    }

    #[test]
    fn root_bounds_contain_every_leaf() {
        let mut t = tree();
        let ids: Vec<ObjectId> = (0..12).map(|_| ObjectId::random()).collect();
        for (i, &id) in ids.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            t.insert(id, sphere(i as f32 * 3.0, 1.0));
        }
        let root_bounds = t.node(t.root().unwrap()).bounds;
        for &id in &ids {
            let leaf = t.lookup(id).unwrap();
            assert!(
                root_bounds.contains(&t.node(leaf).bounds),
                "leaf {id} escapes the root sphere"
            );
        }
    }

    #[test]
    fn overfull_nodes_split_downward_keeping_identity() {
        let mut t = tree();
        let root_uuid_before = {
            let first = ObjectId::random();
            t.insert(first, sphere(0.0, 1.0));
            t.uuid_of(t.root().unwrap())
        };
        let mut split_seen = false;
        for i in 1..6 {
            #[allow(clippy::cast_precision_loss)]
            let out = t.insert(ObjectId::random(), sphere(i as f32, 1.0));
            split_seen |= out.new_aggregate.is_some();
        }
        assert!(split_seen, "six children past branching=4 must split");
        // The root survives the split with its identity intact.
        assert_eq!(t.uuid_of(t.root().unwrap()), root_uuid_before);
        // And every leaf still reaches the root.
        let root = t.root().unwrap();
        for (uuid, _, _, _) in t.iter_nodes().collect::<Vec<_>>() {
            let idx = t.lookup(uuid).unwrap();
            assert!(t.is_self_or_ancestor(root, idx));
        }
    }

    #[test]
    fn removing_the_last_leaf_destroys_the_root() {
        let mut t = tree();
        let a = ObjectId::random();
        let b = ObjectId::random();
        t.insert(a, sphere(0.0, 1.0));
        t.insert(b, sphere(5.0, 1.0));

        let out = t.remove(a).unwrap();
        assert!(!out.root_destroyed);
        assert_eq!(out.removed.len(), 1);

        let out = t.remove(b).unwrap();
        assert!(out.root_destroyed);
        // Leaf plus the collapsed root.
        assert_eq!(out.removed.len(), 2);
        assert_eq!(t.root(), None);
        assert_eq!(t.num_nodes(), 0);
    }

    #[test]
    fn remove_of_unknown_object_is_a_no_op() {
        let mut t = tree();
        assert!(t.remove(ObjectId::random()).is_none());
    }

    #[test]
    fn refit_shrinks_bounds_after_a_leaf_moves_back() {
        let mut t = tree();
        let a = ObjectId::random();
        let b = ObjectId::random();
        t.insert(a, sphere(0.0, 1.0));
        t.insert(b, sphere(2.0, 1.0));

        t.update_leaf(a, sphere(100.0, 1.0)).unwrap();
        let wide = t.node(t.root().unwrap()).bounds.radius;
        t.update_leaf(a, sphere(0.0, 1.0)).unwrap();
        let narrow = t.node(t.root().unwrap()).bounds.radius;
        assert!(narrow < wide);
    }

    #[test]
    fn aggregate_uuids_are_unique_and_distinct_from_leaves() {
        let mut t = tree();
        let mut seen = std::collections::HashSet::new();
        for i in 0..20 {
            #[allow(clippy::cast_precision_loss)]
            t.insert(ObjectId::random(), sphere(i as f32 * 2.0, 1.0));
        }
        for (uuid, _, _, _) in t.iter_nodes() {
            assert!(seen.insert(uuid), "duplicate node uuid {uuid}");
        }
    }
}
