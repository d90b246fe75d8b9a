// SPDX-License-Identifier: Apache-2.0

use crate::aggregate::{AggregateListener, NullAggregateListener};
use crate::config::ProxConfig;
use crate::cut::Cut;
use crate::event::{Addition, EntryKind, Permanence, QueryEvent, Removal};
use crate::query::{Query, QueryId, QueryParams};
use crate::tree::{BvhTree, NodeIdx};
use arbor_geom::{BoundingSphere, SimTime};
use arbor_loc::{ClientId, IndexId, LocationCache, ObjectId};
use glam::Vec3;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Introspection view of one tree node.
#[derive(Debug, Clone)]
pub struct NodeView {
    /// Node identifier.
    pub id: ObjectId,
    /// Parent node, absent for the root.
    pub parent: Option<ObjectId>,
    /// Node bounding sphere.
    pub bounds: BoundingSphere,
    /// Number of query cuts through the node.
    pub cuts: u32,
}

/// One spatial index instance and the queries cut into it.
///
/// The handler exclusively owns its tree and its queries; everything else
/// refers to them by id. All event generation happens here, eagerly, as the
/// tree and cuts change; the worker drains the per-query queues afterward.
pub struct QueryHandler {
    index_id: IndexId,
    static_instance: bool,
    global: bool,
    separate: bool,
    velocity_threshold: f32,
    loc: Arc<LocationCache>,
    tree: BvhTree,
    queries: HashMap<QueryId, Query>,
    next_query: u64,
    listener: Box<dyn AggregateListener>,
}

impl QueryHandler {
    /// Builds a handler instance for one object class.
    #[must_use]
    pub fn new(
        index_id: IndexId,
        static_instance: bool,
        cfg: &ProxConfig,
        loc: Arc<LocationCache>,
    ) -> Self {
        QueryHandler {
            index_id,
            static_instance,
            global: cfg.global_queries,
            separate: cfg.separate_dynamic_objects,
            velocity_threshold: cfg.static_velocity_threshold,
            loc,
            tree: BvhTree::new(cfg.branching_factor, index_id),
            queries: HashMap::new(),
            next_query: 0,
            listener: Box::new(NullAggregateListener),
        }
    }

    /// Installs the aggregate listener. Must happen before objects arrive
    /// so creation events are not missed.
    pub fn set_aggregate_listener(&mut self, listener: Box<dyn AggregateListener>) {
        self.listener = listener;
    }

    /// This handler's tree-local index identifier.
    #[must_use]
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    /// Whether this instance indexes only static objects.
    #[must_use]
    pub fn static_instance(&self) -> bool {
        self.static_instance
    }

    /// Whether `velocity` counts as static for this handler.
    #[must_use]
    pub fn velocity_is_static(&self, velocity: Vec3) -> bool {
        velocity.length() < self.velocity_threshold
    }

    /// The object-admission predicate. Local-vs-replica, static-vs-dynamic
    /// instance, and the global flag all must agree before an object is
    /// accepted; the first refusal wins.
    #[must_use]
    pub fn should_handle(&self, is_local: bool, velocity: Vec3) -> bool {
        if !is_local && !self.global {
            return false;
        }
        if !self.separate {
            return true;
        }
        self.velocity_is_static(velocity) == self.static_instance
    }

    /// Registers a query. The cut stays empty until the next tick seeds it
    /// with the tree root.
    pub fn register_query(&mut self, params: QueryParams) -> QueryId {
        self.next_query += 1;
        let qid = QueryId(self.next_query);
        self.queries.insert(qid, Query::new(params));
        debug!(%qid, index = %self.index_id, "registered query");
        qid
    }

    /// Attaches the destination client. Set last during `init` so the rest
    /// of the setup is in place before any events are drained.
    pub fn set_listener(&mut self, qid: QueryId, client: ClientId) -> bool {
        match self.queries.get_mut(&qid) {
            Some(q) => {
                q.listener = Some(client);
                true
            }
            None => false,
        }
    }

    /// Destroys a query, releasing its cut. No events are emitted; the
    /// client is gone.
    pub fn destroy_query(&mut self, qid: QueryId) -> bool {
        let Some(q) = self.queries.remove(&qid) else {
            return false;
        };
        for idx in q.cut.members().collect::<Vec<_>>() {
            let n = self.tree.dec_cut(idx);
            if !self.tree.node(idx).is_leaf() {
                self.listener
                    .aggregate_observed(self.index_id, self.tree.uuid_of(idx), n);
            }
        }
        debug!(%qid, index = %self.index_id, "destroyed query");
        true
    }

    /// Whether the index currently holds `id` as a leaf.
    #[must_use]
    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.tree.contains_leaf(id)
    }

    /// Number of indexed objects.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.tree.num_leaves()
    }

    /// Number of registered queries.
    #[must_use]
    pub fn num_queries(&self) -> usize {
        self.queries.len()
    }

    /// Number of live tree nodes, aggregates included.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.tree.num_nodes()
    }

    /// Introspection view of a single node, by wire identifier.
    #[must_use]
    pub fn node_view(&self, id: ObjectId) -> Option<NodeView> {
        let idx = self.tree.lookup(id)?;
        let n = self.tree.node(idx);
        Some(NodeView {
            id: n.uuid,
            parent: n.parent.map(|p| self.tree.uuid_of(p)),
            bounds: n.bounds,
            cuts: n.cuts,
        })
    }

    /// Introspection over all tree nodes.
    pub fn iter_nodes(&self) -> impl Iterator<Item = NodeView> + '_ {
        self.tree.iter_nodes().map(|(id, parent, bounds, cuts)| NodeView {
            id,
            parent,
            bounds,
            cuts,
        })
    }

    /// Registered query ids, in no particular order.
    pub fn query_ids(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.queries.keys().copied()
    }

    /// Size of a query's cut.
    #[must_use]
    pub fn cut_size(&self, qid: QueryId) -> Option<usize> {
        self.queries.get(&qid).map(|q| q.cut.len())
    }

    /// Registration parameters of a query.
    #[must_use]
    pub fn query_params(&self, qid: QueryId) -> Option<QueryParams> {
        self.queries.get(&qid).map(|q| q.params)
    }

    /// The client a query delivers to, if a listener is attached.
    #[must_use]
    pub fn query_listener(&self, qid: QueryId) -> Option<ClientId> {
        self.queries.get(&qid).and_then(|q| q.listener)
    }

    /// Whether a query has pending events.
    #[must_use]
    pub fn has_events(&self, qid: QueryId) -> bool {
        self.queries.get(&qid).is_some_and(Query::has_events)
    }

    /// Drains a query's pending events into `out`, in emission order.
    pub fn pop_events(&mut self, qid: QueryId, out: &mut VecDeque<QueryEvent>) {
        if let Some(q) = self.queries.get_mut(&qid) {
            q.pop_events(out);
        }
    }

    /// Admits `id` into the index. The object must be tracked by the
    /// location cache and must not already be present; duplicate insertion
    /// is an engine bug and asserts.
    pub fn add_object(&mut self, id: ObjectId) {
        let Some(rec) = self.loc.location(id) else {
            warn!(%id, index = %self.index_id, "add_object without a location record");
            return;
        };
        assert!(
            !self.tree.contains_leaf(id),
            "duplicate add of object {id} to index {}",
            self.index_id
        );
        let sphere = rec.bounds.world_sphere(rec.motion.position);
        let outcome = self.tree.insert(id, sphere);

        if let Some(root) = outcome.created_root {
            self.listener
                .aggregate_created(self.index_id, self.tree.uuid_of(root));
        }
        if let Some(agg) = outcome.new_aggregate {
            let uuid = self.tree.uuid_of(agg);
            self.listener.aggregate_created(self.index_id, uuid);
            self.listener
                .aggregate_bounds_updated(self.index_id, uuid, self.tree.node(agg).bounds);
        }
        if let Some(parent) = self.tree.parent_of(outcome.leaf) {
            self.listener.aggregate_child_added(
                self.index_id,
                self.tree.uuid_of(parent),
                id,
                self.tree.node(parent).bounds,
            );
        }
        for &n in &outcome.refit_changed {
            self.listener.aggregate_bounds_updated(
                self.index_id,
                self.tree.uuid_of(n),
                self.tree.node(n).bounds,
            );
        }

        // Cut repair: a leaf with no ancestor on a live cut joins that cut,
        // otherwise the frontier would no longer cover it.
        let leaf = outcome.leaf;
        let parent_uuid = self.tree.parent_of(leaf).map(|p| self.tree.uuid_of(p));
        let QueryHandler {
            ref mut tree,
            ref mut queries,
            index_id,
            ..
        } = *self;
        for q in queries.values_mut() {
            if !q.cut.seeded() || q.cut.covers(tree, leaf) {
                continue;
            }
            q.cut.insert(leaf);
            tree.inc_cut(leaf);
            let mut ev = QueryEvent::new(index_id);
            ev.additions.push(Addition {
                id,
                parent: parent_uuid,
                kind: EntryKind::Object,
            });
            q.events.push_back(ev);
        }
    }

    /// Removes `id` from the index, collapsing emptied ancestors and
    /// repairing every cut the removal touches. Removing an unknown object
    /// is a no-op. `permanent` marks the leaf's removal for clients;
    /// collapsed aggregates are always transient.
    pub fn remove_object(&mut self, id: ObjectId, permanent: bool) -> bool {
        let leaf_parent = self.tree.lookup(id).and_then(|l| self.tree.parent_of(l));
        let Some(outcome) = self.tree.remove(id) else {
            return false;
        };

        let QueryHandler {
            ref mut tree,
            ref mut queries,
            ref listener,
            index_id,
            ..
        } = *self;

        for q in queries.values_mut() {
            let mut ev = QueryEvent::new(index_id);
            for &(idx, uuid, was_leaf) in &outcome.removed {
                if q.cut.remove(idx) {
                    let permanence = if was_leaf && permanent {
                        Permanence::Permanent
                    } else {
                        Permanence::Transient
                    };
                    ev.removals.push(Removal { id: uuid, permanence });
                }
            }
            if outcome.root_destroyed {
                q.cut.reset();
            }
            if !ev.is_empty() {
                q.events.push_back(ev);
            }
        }

        for &(idx, uuid, was_leaf) in &outcome.removed {
            if !was_leaf {
                listener.aggregate_destroyed(index_id, uuid);
            }
            let _ = idx;
        }
        if let Some(p) = leaf_parent {
            if !outcome.removed.iter().any(|&(i, _, _)| i == p) {
                listener.aggregate_child_removed(index_id, tree.uuid_of(p), id, tree.node(p).bounds);
            }
        }
        for &n in &outcome.refit_changed {
            listener.aggregate_bounds_updated(index_id, tree.uuid_of(n), tree.node(n).bounds);
        }
        true
    }

    /// Recomputes a leaf's sphere from the cache and refits its ancestors.
    /// Emits no query events; clients learn about motion through their
    /// location subscriptions.
    pub fn update_object(&mut self, id: ObjectId) {
        let Some(rec) = self.loc.location(id) else {
            return;
        };
        let sphere = rec.bounds.world_sphere(rec.motion.position);
        if let Some(changed) = self.tree.update_leaf(id, sphere) {
            for &n in &changed {
                self.listener.aggregate_bounds_updated(
                    self.index_id,
                    self.tree.uuid_of(n),
                    self.tree.node(n).bounds,
                );
            }
        }
    }

    /// Advances all queries: unseeded cuts whose tree has a root receive it
    /// and emit the initial lone addition.
    pub fn tick(&mut self, _now: SimTime) {
        let Some(root) = self.tree.root() else {
            return;
        };
        let root_uuid = self.tree.uuid_of(root);
        let QueryHandler {
            ref mut tree,
            ref mut queries,
            ref listener,
            index_id,
            ..
        } = *self;
        for q in queries.values_mut() {
            if q.cut.seeded() {
                continue;
            }
            q.cut.insert(root);
            q.cut.mark_seeded();
            let n = tree.inc_cut(root);
            listener.aggregate_observed(index_id, root_uuid, n);
            let mut ev = QueryEvent::new(index_id);
            ev.additions.push(Addition {
                id: root_uuid,
                parent: None,
                kind: EntryKind::Aggregate,
            });
            q.events.push_back(ev);
        }
    }

    /// Pushes a query's cut down through `node`: the node leaves the cut
    /// and its children join, each announced with `node` as parent. Leaves
    /// and nodes not on the cut are no-ops.
    pub fn refine(&mut self, qid: QueryId, node: ObjectId) {
        let Some(idx) = self.tree.lookup(node) else {
            debug!(%node, index = %self.index_id, "refine of unknown node");
            return;
        };
        let QueryHandler {
            ref mut tree,
            ref mut queries,
            ref listener,
            index_id,
            ..
        } = *self;
        let Some(q) = queries.get_mut(&qid) else {
            return;
        };
        if !q.cut.contains(idx) {
            debug!(%node, %qid, "refine of node not on the cut");
            return;
        }
        let Some(children) = tree.children_of(idx).map(<[NodeIdx]>::to_vec) else {
            return;
        };

        q.cut.remove(idx);
        let n = tree.dec_cut(idx);
        listener.aggregate_observed(index_id, node, n);

        let mut ev = QueryEvent::new(index_id);
        for c in children {
            q.cut.insert(c);
            let count = tree.inc_cut(c);
            let kind = if tree.node(c).is_leaf() {
                EntryKind::Object
            } else {
                listener.aggregate_observed(index_id, tree.uuid_of(c), count);
                EntryKind::Aggregate
            };
            ev.additions.push(Addition {
                id: tree.uuid_of(c),
                parent: Some(node),
                kind,
            });
        }
        q.events.push_back(ev);
    }

    /// Pulls a query's cut up onto `node`: every cut member beneath it is
    /// coarsened away step by step (transient removals) and `node` joins
    /// the cut. A no-op if `node` is already on the cut, unknown, or the
    /// frontier does not pass through its subtree.
    pub fn coarsen(&mut self, qid: QueryId, node: ObjectId) {
        let Some(idx) = self.tree.lookup(node) else {
            debug!(%node, index = %self.index_id, "coarsen of unknown node");
            return;
        };
        let QueryHandler {
            ref mut tree,
            ref mut queries,
            ref listener,
            index_id,
            ..
        } = *self;
        let Some(q) = queries.get_mut(&qid) else {
            return;
        };
        if q.cut.contains(idx) {
            return;
        }
        if !can_collapse(tree, &q.cut, idx) {
            debug!(%node, %qid, "coarsen outside the cut frontier");
            return;
        }
        let Some(children) = tree.children_of(idx).map(<[NodeIdx]>::to_vec) else {
            return;
        };

        let mut ev = QueryEvent::new(index_id);
        for c in children {
            collapse(tree, &mut q.cut, c, &mut ev.removals, listener.as_ref(), index_id);
        }
        q.cut.insert(idx);
        let n = tree.inc_cut(idx);
        listener.aggregate_observed(index_id, node, n);
        q.events.push_back(ev);
    }

    #[cfg(test)]
    pub(crate) fn cut_invariant_holds(&self, qid: QueryId) -> bool {
        self.queries
            .get(&qid)
            .is_some_and(|q| q.cut.check_invariant(&self.tree))
    }

    #[cfg(test)]
    pub(crate) fn cut_node_uuids(&self, qid: QueryId) -> Vec<ObjectId> {
        let Some(q) = self.queries.get(&qid) else {
            return Vec::new();
        };
        let mut out: Vec<ObjectId> = q.cut.members().map(|i| self.tree.uuid_of(i)).collect();
        out.sort();
        out
    }

    /// UUID of the current tree root, if the tree is non-empty.
    #[must_use]
    pub fn root_uuid(&self) -> Option<ObjectId> {
        self.tree.root().map(|r| self.tree.uuid_of(r))
    }
}

/// Whether the frontier beneath `idx` can be fully pulled up onto it: the
/// node is on the cut already, or all of its children can.
fn can_collapse(tree: &BvhTree, cut: &Cut, idx: NodeIdx) -> bool {
    if cut.contains(idx) {
        return true;
    }
    match tree.children_of(idx) {
        None => false,
        Some(children) => children.iter().all(|&c| can_collapse(tree, cut, c)),
    }
}

/// Removes every cut member in `idx`'s subtree, recording a transient
/// removal for each node the cut retreats through (intermediate nodes the
/// client learned about during earlier refines included).
fn collapse(
    tree: &mut BvhTree,
    cut: &mut Cut,
    idx: NodeIdx,
    removals: &mut Vec<Removal>,
    listener: &dyn AggregateListener,
    index_id: IndexId,
) {
    if cut.remove(idx) {
        let n = tree.dec_cut(idx);
        if !tree.node(idx).is_leaf() {
            listener.aggregate_observed(index_id, tree.uuid_of(idx), n);
        }
        removals.push(Removal {
            id: tree.uuid_of(idx),
            permanence: Permanence::Transient,
        });
        return;
    }
    let children = tree.children_of(idx).map(<[NodeIdx]>::to_vec).unwrap_or_default();
    for c in children {
        collapse(tree, cut, c, removals, listener, index_id);
    }
    removals.push(Removal {
        id: tree.uuid_of(idx),
        permanence: Permanence::Transient,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_geom::{AggregateBounds, TimedMotion, TimedRotation};
    use arbor_loc::LocRecord;

    fn fixture(branching: usize) -> (Arc<LocationCache>, QueryHandler) {
        let cfg = ProxConfig {
            branching_factor: branching,
            ..ProxConfig::default()
        };
        let loc = Arc::new(LocationCache::new());
        let handler = QueryHandler::new(IndexId(0), true, &cfg, loc.clone());
        (loc, handler)
    }

    fn track(loc: &LocationCache, x: f32) -> ObjectId {
        let id = ObjectId::random();
        loc.track(
            id,
            LocRecord {
                motion: TimedMotion::stationary(SimTime::ZERO, Vec3::new(x, 0.0, 0.0)),
                rotation: TimedRotation::identity(SimTime::ZERO),
                bounds: AggregateBounds::exact(1.0),
                mesh: None,
                physics: None,
                is_aggregate: false,
                is_local: true,
            },
        );
        id
    }

    fn seeded_query(loc: &LocationCache, handler: &mut QueryHandler, n: usize) -> QueryId {
        for i in 0..n {
            #[allow(clippy::cast_precision_loss)]
            let id = track(loc, i as f32 * 3.0);
            handler.add_object(id);
        }
        let qid = handler.register_query(QueryParams::placeholder(SimTime::ZERO));
        handler.set_listener(qid, ClientId(1));
        handler.tick(SimTime::ZERO);
        qid
    }

    #[test]
    fn refine_then_coarsen_restores_the_cut_exactly() {
        let (loc, mut handler) = fixture(10);
        let qid = seeded_query(&loc, &mut handler, 4);
        let before = handler.cut_node_uuids(qid);
        let root = handler.root_uuid().unwrap();

        handler.refine(qid, root);
        assert!(handler.cut_invariant_holds(qid));
        assert_ne!(handler.cut_node_uuids(qid), before);

        handler.coarsen(qid, root);
        assert!(handler.cut_invariant_holds(qid));
        assert_eq!(handler.cut_node_uuids(qid), before);
    }

    #[test]
    fn deep_coarsen_retreats_through_intermediate_nodes() {
        // Small branching forces aggregates between the root and leaves.
        let (loc, mut handler) = fixture(2);
        let qid = seeded_query(&loc, &mut handler, 6);
        let root = handler.root_uuid().unwrap();

        // Refine everything reachable until the cut is all leaves.
        loop {
            let aggregates: Vec<ObjectId> = handler
                .cut_node_uuids(qid)
                .into_iter()
                .filter(|&u| !handler.contains_object(u))
                .collect();
            if aggregates.is_empty() {
                break;
            }
            for agg in aggregates {
                handler.refine(qid, agg);
            }
            assert!(handler.cut_invariant_holds(qid));
        }
        assert_eq!(handler.cut_size(qid), Some(6));

        let mut events = VecDeque::new();
        handler.pop_events(qid, &mut events);
        handler.coarsen(qid, root);
        assert!(handler.cut_invariant_holds(qid));
        assert_eq!(handler.cut_node_uuids(qid), vec![root]);

        // Every node the cut retreated through is a transient removal.
        let mut events = VecDeque::new();
        handler.pop_events(qid, &mut events);
        let removals: usize = events.iter().map(|e| e.removals.len()).sum();
        assert!(removals >= 6, "all leaves plus intermediates retreat");
        assert!(events
            .iter()
            .flat_map(|e| e.removals.iter())
            .all(|r| r.permanence == Permanence::Transient));
    }

    #[test]
    fn refine_of_a_leaf_or_unknown_node_is_a_no_op() {
        let (loc, mut handler) = fixture(10);
        let qid = seeded_query(&loc, &mut handler, 2);
        let root = handler.root_uuid().unwrap();
        handler.refine(qid, root);
        let before = handler.cut_node_uuids(qid);
        let leaf = before[0];

        handler.refine(qid, leaf);
        handler.refine(qid, ObjectId::random());
        handler.coarsen(qid, ObjectId::random());
        assert_eq!(handler.cut_node_uuids(qid), before);
    }

    #[test]
    #[should_panic(expected = "duplicate add")]
    fn duplicate_add_is_a_contract_violation() {
        let (loc, mut handler) = fixture(10);
        let id = track(&loc, 0.0);
        handler.add_object(id);
        handler.add_object(id);
    }

    #[test]
    fn destroy_query_releases_cut_refcounts() {
        let (loc, mut handler) = fixture(10);
        let qid = seeded_query(&loc, &mut handler, 3);
        let root = handler.root_uuid().unwrap();
        handler.refine(qid, root);
        assert!(handler.iter_nodes().any(|n| n.cuts > 0));

        assert!(handler.destroy_query(qid));
        assert!(handler.iter_nodes().all(|n| n.cuts == 0));
        assert!(!handler.destroy_query(qid));
    }
}
