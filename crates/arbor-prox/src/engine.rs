// SPDX-License-Identifier: Apache-2.0

use crate::aggregate::AggregateListener;
use crate::classifier::Classifier;
use crate::config::{ConfigError, ProxConfig};
use crate::event::QueryEvent;
use crate::handler::{NodeView, QueryHandler};
use crate::query::{QueryId, QueryParams};
use arbor_geom::{SimTime, TimedMotion};
use arbor_loc::{ClientId, IndexId, LocationCache, ObjectId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// The two object classes of the static/dynamic split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Slow or stationary objects.
    Static,
    /// Moving objects.
    Dynamic,
}

impl ObjectClass {
    /// Both classes, static first: the drain order used everywhere.
    pub const ALL: [ObjectClass; 2] = [ObjectClass::Static, ObjectClass::Dynamic];

    /// Handler slot index.
    #[must_use]
    pub fn slot(self) -> usize {
        match self {
            ObjectClass::Static => 0,
            ObjectClass::Dynamic => 1,
        }
    }

    /// Short label used in logs and handler names.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Static => "static",
            ObjectClass::Dynamic => "dynamic",
        }
    }

    /// The introspection handler name, `oh-queries.<class>-objects`.
    #[must_use]
    pub fn handler_name(self) -> String {
        format!("oh-queries.{}-objects", self.label())
    }

    /// Parses an introspection handler name. The form is
    /// `oh-queries.<class>-objects` with exactly one dot.
    #[must_use]
    pub fn parse_handler_name(name: &str) -> Option<ObjectClass> {
        let (handler_part, class_part) = name.split_once('.')?;
        if handler_part != "oh-queries" || class_part.contains('.') {
            return None;
        }
        match class_part {
            "static-objects" => Some(ObjectClass::Static),
            "dynamic-objects" => Some(ObjectClass::Dynamic),
            _ => None,
        }
    }
}

/// One handler slot plus its pending swap intents and client query map.
struct HandlerData {
    handler: QueryHandler,
    queries_by_client: HashMap<ClientId, QueryId>,
    /// Objects to remove before the next tick (swap sources).
    removals: HashSet<ObjectId>,
    /// Objects to add after the next tick's removals (swap targets).
    additions: HashSet<ObjectId>,
}

/// Pending events drained from one query.
pub struct DrainedQuery {
    /// Destination client.
    pub client: ClientId,
    /// Object class of the originating handler.
    pub class: ObjectClass,
    /// Tree-local index identifier.
    pub index_id: IndexId,
    /// Events in emission order.
    pub events: VecDeque<QueryEvent>,
}

/// The proximity engine: one or two query handler instances plus the
/// static/dynamic classifier and the swap buckets between them.
///
/// Runs entirely on the worker thread. The only shared state it reads is
/// the location cache.
pub struct ProxEngine {
    cfg: ProxConfig,
    loc: Arc<LocationCache>,
    handlers: Vec<HandlerData>,
    classifier: Classifier,
}

impl ProxEngine {
    /// Builds an engine from a validated configuration.
    pub fn new(cfg: ProxConfig, loc: Arc<LocationCache>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let mut handlers = Vec::new();
        for class in ObjectClass::ALL.iter().take(cfg.handlers_per_tree) {
            let static_instance =
                cfg.separate_dynamic_objects && *class == ObjectClass::Static;
            #[allow(clippy::cast_possible_truncation)]
            let index_id = IndexId(class.slot() as u32);
            handlers.push(HandlerData {
                handler: QueryHandler::new(index_id, static_instance, &cfg, loc.clone()),
                queries_by_client: HashMap::new(),
                removals: HashSet::new(),
                additions: HashSet::new(),
            });
        }
        Ok(ProxEngine {
            classifier: Classifier::new(cfg.move_to_static_delay),
            cfg,
            loc,
            handlers,
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &ProxConfig {
        &self.cfg
    }

    /// Classes with a live handler slot.
    pub fn classes(&self) -> impl Iterator<Item = ObjectClass> + '_ {
        ObjectClass::ALL.into_iter().take(self.handlers.len())
    }

    /// The handler for `class`, if the slot exists.
    #[must_use]
    pub fn handler(&self, class: ObjectClass) -> Option<&QueryHandler> {
        self.handlers.get(class.slot()).map(|h| &h.handler)
    }

    /// Installs an aggregate listener on one handler instance.
    pub fn set_aggregate_listener(
        &mut self,
        class: ObjectClass,
        listener: Box<dyn AggregateListener>,
    ) {
        if let Some(h) = self.handlers.get_mut(class.slot()) {
            h.handler.set_aggregate_listener(listener);
        }
    }

    /// Whether any handler currently indexes `id`.
    #[must_use]
    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.handlers.iter().any(|h| h.handler.contains_object(id))
    }

    /// Total indexed objects across handlers.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.handlers.iter().map(|h| h.handler.num_objects()).sum()
    }

    /// Pending classifier timeouts.
    #[must_use]
    pub fn classifier_pending(&self) -> usize {
        self.classifier.len()
    }

    /// Admits a tracked object into whichever handler's predicate accepts
    /// it. With the split enabled the predicates are disjoint, so an object
    /// lands in at most one index.
    pub fn add_object(&mut self, id: ObjectId) {
        let Some(rec) = self.loc.location(id) else {
            debug!(%id, "add_object for an untracked object");
            return;
        };
        for h in &mut self.handlers {
            if h.handler.should_handle(rec.is_local, rec.motion.velocity) {
                h.handler.add_object(id);
                return;
            }
        }
        debug!(%id, is_local = rec.is_local, "no handler admitted object");
    }

    /// Removes an object from whichever index holds it, cancels any pending
    /// classifier timeout, and clears stale swap intents.
    pub fn remove_object(&mut self, id: ObjectId, permanent: bool) {
        self.classifier.cancel(id);
        for h in &mut self.handlers {
            h.removals.remove(&id);
            h.additions.remove(&id);
            h.handler.remove_object(id, permanent);
        }
    }

    /// Feeds a location update through: refits the containing tree and runs
    /// the velocity-class hysteresis.
    pub fn on_location_updated(
        &mut self,
        is_local: bool,
        id: ObjectId,
        motion: &TimedMotion,
        now: SimTime,
    ) {
        for h in &mut self.handlers {
            if h.handler.contains_object(id) {
                h.handler.update_object(id);
                break;
            }
        }
        if !self.cfg.separate_dynamic_objects || !self.contains_object(id) {
            return;
        }

        let is_static = motion.speed() < self.cfg.static_velocity_threshold;
        if is_static {
            // A slow sample supersedes any still-pending move to dynamic.
            for h in &mut self.handlers {
                h.removals.remove(&id);
                h.additions.remove(&id);
            }
            let in_static = self.handlers[ObjectClass::Static.slot()]
                .handler
                .contains_object(id);
            if !in_static && !self.classifier.pending(id) {
                self.classifier.schedule(id, is_local, now);
            }
        } else {
            self.classifier.cancel(id);
            let in_static = self.handlers[ObjectClass::Static.slot()]
                .handler
                .contains_object(id);
            if in_static {
                self.request_swap(id, false);
            }
        }
    }

    /// Records swap intent in the per-handler buckets. The latest intent
    /// wins: any older pending intent for the object is dropped first.
    fn request_swap(&mut self, id: ObjectId, to_static: bool) {
        for h in &mut self.handlers {
            h.removals.remove(&id);
            h.additions.remove(&id);
        }
        let (from, to) = if to_static {
            (ObjectClass::Dynamic, ObjectClass::Static)
        } else {
            (ObjectClass::Static, ObjectClass::Dynamic)
        };
        if self.handlers[to.slot()].handler.contains_object(id) {
            return;
        }
        assert!(
            self.handlers[from.slot()].handler.contains_object(id),
            "object {id} is in neither index during a class swap"
        );
        debug!(%id, from = from.label(), to = to.label(), "swapping object class");
        self.handlers[from.slot()].removals.insert(id);
        self.handlers[to.slot()].additions.insert(id);
    }

    /// Advances the engine one tick.
    ///
    /// Expired move-to-static timeouts turn into swap intents first. Then
    /// every pending removal drains, the handlers tick, and pending
    /// additions drain last, so a swapped object always emits its removal
    /// before its addition within the tick.
    pub fn tick(&mut self, now: SimTime) {
        for (id, _is_local) in self.classifier.pop_expired(now) {
            let Some(rec) = self.loc.location(id) else {
                continue;
            };
            if rec.motion.speed() < self.cfg.static_velocity_threshold && self.contains_object(id)
            {
                self.request_swap(id, true);
            }
        }

        for i in 0..self.handlers.len() {
            let ids: Vec<ObjectId> = self.handlers[i].removals.drain().collect();
            for id in ids {
                self.handlers[i].handler.remove_object(id, false);
            }
        }
        for h in &mut self.handlers {
            h.handler.tick(now);
        }
        for i in 0..self.handlers.len() {
            let ids: Vec<ObjectId> = self.handlers[i].additions.drain().collect();
            for id in ids {
                if !self.loc.tracking(id) || self.handlers[i].handler.contains_object(id) {
                    continue;
                }
                self.handlers[i].handler.add_object(id);
            }
        }
    }

    /// Allocates one query per live handler slot for `client`, attaching
    /// the listeners only after every registration is in place.
    pub fn init_client(&mut self, client: ClientId, now: SimTime) {
        let mut registered = Vec::new();
        for h in &mut self.handlers {
            if h.queries_by_client.contains_key(&client) {
                debug!(%client, "init for a client that already has queries");
                return;
            }
            let qid = h.handler.register_query(QueryParams::placeholder(now));
            h.queries_by_client.insert(client, qid);
            registered.push(qid);
        }
        for (h, qid) in self.handlers.iter_mut().zip(registered) {
            h.handler.set_listener(qid, client);
        }
    }

    /// Applies `refine` for each node to every class's matching query.
    pub fn refine_nodes(&mut self, client: ClientId, nodes: &[ObjectId]) {
        for h in &mut self.handlers {
            let Some(&qid) = h.queries_by_client.get(&client) else {
                continue;
            };
            for &node in nodes {
                h.handler.refine(qid, node);
            }
        }
    }

    /// Applies `coarsen` for each node to every class's matching query.
    pub fn coarsen_nodes(&mut self, client: ClientId, nodes: &[ObjectId]) {
        for h in &mut self.handlers {
            let Some(&qid) = h.queries_by_client.get(&client) else {
                continue;
            };
            for &node in nodes {
                h.handler.coarsen(qid, node);
            }
        }
    }

    /// Tears down every query belonging to `client`. Returns whether any
    /// existed.
    pub fn destroy_client(&mut self, client: ClientId) -> bool {
        let mut any = false;
        for h in &mut self.handlers {
            if let Some(qid) = h.queries_by_client.remove(&client) {
                h.handler.destroy_query(qid);
                any = true;
            }
        }
        any
    }

    /// The queries registered for `client`, class by class.
    #[must_use]
    pub fn client_queries(&self, client: ClientId) -> Vec<(ObjectClass, QueryId)> {
        let mut out = Vec::new();
        for (class, h) in self.classes().zip(&self.handlers) {
            if let Some(&qid) = h.queries_by_client.get(&client) {
                out.push((class, qid));
            }
        }
        out
    }

    /// Cut sizes for `client`'s queries, for introspection.
    #[must_use]
    pub fn client_cut_sizes(&self, client: ClientId) -> Vec<(ObjectClass, usize)> {
        self.client_queries(client)
            .into_iter()
            .filter_map(|(class, qid)| {
                let size = self.handlers[class.slot()].handler.cut_size(qid)?;
                Some((class, size))
            })
            .collect()
    }

    /// Introspection over one handler's tree nodes.
    #[must_use]
    pub fn nodes(&self, class: ObjectClass) -> Option<Vec<NodeView>> {
        self.handler(class).map(|h| h.iter_nodes().collect())
    }

    /// Drains every query with pending events and an attached listener.
    pub fn drain_events(&mut self) -> Vec<DrainedQuery> {
        let mut out = Vec::new();
        for (class, h) in ObjectClass::ALL.iter().zip(&mut self.handlers) {
            let index_id = h.handler.index_id();
            let clients: Vec<(ClientId, QueryId)> = h
                .queries_by_client
                .iter()
                .map(|(&c, &q)| (c, q))
                .collect();
            for (client, qid) in clients {
                if !h.handler.has_events(qid) || h.handler.query_listener(qid).is_none() {
                    continue;
                }
                let mut events = VecDeque::new();
                h.handler.pop_events(qid, &mut events);
                out.push(DrainedQuery {
                    client,
                    class: *class,
                    index_id,
                    events,
                });
            }
        }
        out
    }
}
