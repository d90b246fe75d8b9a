// SPDX-License-Identifier: Apache-2.0
//! The proximity worker loop and the queues that feed it.
//!
//! The worker is a dedicated OS thread running a single-threaded loop: it
//! drains commands and location updates from the main loop, ticks the
//! engine on a fixed cadence, and posts serialized result frames and
//! loc-subscription changes back. Nothing here blocks on the network.

use crate::control::{execute_introspection, ControlRequest};
use crate::dispatch::{self, CommandOutcome};
use crate::pipeline::{self, FrameContext};
use arbor_geom::{AggregateBounds, BoundingSphere, SimTime, TimedMotion};
use arbor_loc::{ClientId, IndexId, LocListener, LocationCache, ObjectId};
use arbor_prox::{coalesce, AggregateListener, ObjectClass, ProxEngine};
use bytes::Bytes;
use glam::Vec3;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Monotonic simulation clock.
pub struct SimClock {
    epoch: Instant,
}

impl SimClock {
    /// Starts the clock at the current instant.
    pub fn new() -> Self {
        SimClock {
            epoch: Instant::now(),
        }
    }

    /// The current simulation time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn now(&self) -> SimTime {
        SimTime::from_micros(self.epoch.elapsed().as_micros() as u64)
    }
}

/// Messages posted from the main loop to the worker.
pub enum WorkerMsg {
    /// A decoded command frame from a client.
    Command {
        /// Originating client.
        client: ClientId,
        /// Raw `query_parameters` JSON body.
        params: String,
        /// The client's sequence-number bundle, installed on first contact.
        seqnos: Arc<AtomicU64>,
    },
    /// A client's session closed or reset.
    SessionEnded {
        /// The departed client.
        client: ClientId,
    },
    /// An object left the location cache.
    ObjectUntracked {
        /// The untracked object.
        id: ObjectId,
    },
    /// An object's motion changed (also fired for the initial track).
    LocationUpdated {
        /// Locally hosted vs. replica.
        is_local: bool,
        /// The object.
        id: ObjectId,
        /// The new motion sample.
        motion: TimedMotion,
    },
    /// An introspection request from the control surface.
    Control(ControlRequest),
}

/// Tasks posted from the worker back to the main loop. A single FIFO
/// carries frames and subscription changes so subscriptions observe the
/// same order as the events that caused them.
pub enum MainTask {
    /// Ship a serialized result frame to a client.
    SendResult {
        /// Destination client.
        client: ClientId,
        /// Encoded packet bytes.
        frame: Bytes,
    },
    /// Install a loc subscription.
    AddLocSubscription {
        /// Observing client.
        client: ClientId,
        /// Observed object.
        observed: ObjectId,
        /// Index the observation came from.
        index: IndexId,
    },
    /// Remove a loc subscription.
    RemoveLocSubscription {
        /// Observing client.
        client: ClientId,
        /// Observed object.
        observed: ObjectId,
        /// Index the observation came from.
        index: IndexId,
    },
    /// Drop every subscription a client holds.
    RemoveAllLocSubscriptions {
        /// The departed client.
        client: ClientId,
    },
    /// Mirror a fresh aggregate into the location cache.
    TrackAggregate {
        /// Aggregate node id.
        id: ObjectId,
        /// Stationary motion at the aggregate's center.
        motion: TimedMotion,
        /// Aggregate bounding info.
        bounds: AggregateBounds,
    },
    /// Update a mirrored aggregate's position and bounds.
    UpdateAggregate {
        /// Aggregate node id.
        id: ObjectId,
        /// Stationary motion at the new center.
        motion: TimedMotion,
        /// New bounding info.
        bounds: AggregateBounds,
    },
    /// Drop a mirrored aggregate.
    UntrackAggregate {
        /// Aggregate node id.
        id: ObjectId,
    },
}

/// Forwards location cache mutations into the worker queue. Installed on
/// the cache by the main loop.
pub struct LocForwarder {
    tx: mpsc::Sender<WorkerMsg>,
}

impl LocForwarder {
    /// Builds a forwarder over the worker channel.
    pub fn new(tx: mpsc::Sender<WorkerMsg>) -> Self {
        LocForwarder { tx }
    }
}

impl LocListener for LocForwarder {
    fn on_location_updated(&self, is_local: bool, id: ObjectId, motion: &TimedMotion) {
        let _ = self.tx.send(WorkerMsg::LocationUpdated {
            is_local,
            id,
            motion: *motion,
        });
    }

    fn on_object_untracked(&self, id: ObjectId) {
        let _ = self.tx.send(WorkerMsg::ObjectUntracked { id });
    }
}

/// Mirrors static-index aggregates into the location cache via the main
/// loop so clients can subscribe to them like any other object.
pub struct AggregateMirror {
    tx: UnboundedSender<MainTask>,
    clock: Arc<SimClock>,
}

impl AggregateMirror {
    /// Builds a mirror over the main-task channel.
    pub fn new(tx: UnboundedSender<MainTask>, clock: Arc<SimClock>) -> Self {
        AggregateMirror { tx, clock }
    }

    fn record(&self, bounds: BoundingSphere) -> (TimedMotion, AggregateBounds) {
        (
            TimedMotion::stationary(self.clock.now(), bounds.center),
            AggregateBounds::new(Vec3::ZERO, bounds.radius, 0.0),
        )
    }
}

impl AggregateListener for AggregateMirror {
    fn aggregate_created(&self, _index: IndexId, id: ObjectId) {
        let (motion, bounds) = self.record(BoundingSphere::zero());
        let _ = self.tx.send(MainTask::TrackAggregate { id, motion, bounds });
    }

    fn aggregate_bounds_updated(&self, _index: IndexId, id: ObjectId, bounds: BoundingSphere) {
        let (motion, bounds) = self.record(bounds);
        let _ = self.tx.send(MainTask::UpdateAggregate { id, motion, bounds });
    }

    fn aggregate_destroyed(&self, _index: IndexId, id: ObjectId) {
        let _ = self.tx.send(MainTask::UntrackAggregate { id });
    }

    fn aggregate_observed(&self, index: IndexId, id: ObjectId, nobservers: u32) {
        debug!(%index, %id, nobservers, "aggregate observer count changed");
    }
}

/// The worker state: the engine plus per-client sequence bundles.
pub struct ProxWorker {
    engine: ProxEngine,
    loc: Arc<LocationCache>,
    clock: Arc<SimClock>,
    server_id: String,
    tick_interval: Duration,
    seqnos: HashMap<ClientId, Arc<AtomicU64>>,
    main_tx: UnboundedSender<MainTask>,
}

impl ProxWorker {
    /// Builds the worker.
    pub fn new(
        engine: ProxEngine,
        loc: Arc<LocationCache>,
        clock: Arc<SimClock>,
        server_id: String,
        tick_interval: Duration,
        main_tx: UnboundedSender<MainTask>,
    ) -> Self {
        ProxWorker {
            engine,
            loc,
            clock,
            server_id,
            tick_interval,
            seqnos: HashMap::new(),
            main_tx,
        }
    }

    /// Runs the worker loop until the command channel closes.
    pub fn run(mut self, rx: &mpsc::Receiver<WorkerMsg>) {
        info!(tick = ?self.tick_interval, "proximity worker running");
        let mut next_tick = Instant::now() + self.tick_interval;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    self.handle(msg);
                    self.flush_results();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let now = self.clock.now();
                    self.engine.tick(now);
                    self.flush_results();
                    next_tick += self.tick_interval;
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("worker channel closed; proximity worker stopping");
                    break;
                }
            }
        }
    }

    /// Handles one inbound message.
    pub fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Command {
                client,
                params,
                seqnos,
            } => {
                self.seqnos.entry(client).or_insert(seqnos);
                let now = self.clock.now();
                match dispatch::apply(&mut self.engine, client, &params, now) {
                    CommandOutcome::Destroyed => self.forget_client(client),
                    CommandOutcome::Handled | CommandOutcome::Ignored => {}
                }
            }
            WorkerMsg::SessionEnded { client } => {
                self.engine.destroy_client(client);
                self.forget_client(client);
            }
            WorkerMsg::ObjectUntracked { id } => {
                self.engine.remove_object(id, true);
            }
            WorkerMsg::LocationUpdated {
                is_local,
                id,
                motion,
            } => {
                let Some(rec) = self.loc.location(id) else {
                    return;
                };
                if rec.is_aggregate {
                    return;
                }
                let now = self.clock.now();
                if self.engine.contains_object(id) {
                    self.engine.on_location_updated(is_local, id, &motion, now);
                } else {
                    self.engine.add_object(id);
                }
            }
            WorkerMsg::Control(req) => {
                let reply = execute_introspection(&self.engine, &req.command, &req.args);
                if req.reply.send(reply).is_err() {
                    debug!("control requester went away before the reply");
                }
            }
        }
    }

    fn forget_client(&mut self, client: ClientId) {
        self.seqnos.remove(&client);
        let _ = self
            .main_tx
            .send(MainTask::RemoveAllLocSubscriptions { client });
    }

    /// Drains every query with pending events, coalesces, frames, and posts
    /// the results plus subscription changes to the main loop in order.
    pub fn flush_results(&mut self) {
        let drained = self.engine.drain_events();
        if drained.is_empty() {
            return;
        }
        let now = self.clock.now();
        let max = self.engine.config().max_per_result;
        for d in drained {
            let Some(bundle) = self.seqnos.get(&d.client).cloned() else {
                warn!(client = %d.client, "dropping events for a client with no sequence bundle");
                continue;
            };
            let events = coalesce(d.events, max);
            if events.is_empty() {
                continue;
            }
            let Some(handler) = self.engine.handler(d.class) else {
                continue;
            };
            let ctx = FrameContext {
                client: d.client,
                class: d.class,
                index_id: d.index_id,
                server_id: &self.server_id,
                now,
                max_per_result: max,
            };
            for task in pipeline::build_tasks(&ctx, events, handler, &self.loc, &bundle) {
                let _ = self.main_tx.send(task);
            }
        }
    }

    /// Engine access for tests and the control path.
    #[cfg(test)]
    pub(crate) fn engine(&mut self) -> &mut ProxEngine {
        &mut self.engine
    }
}

/// Spawns the worker on a dedicated thread.
pub fn spawn(
    worker: ProxWorker,
    rx: mpsc::Receiver<WorkerMsg>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("prox".into())
        .spawn(move || worker.run(&rx))
}

/// Convenience for classification labels in result frames.
pub fn classification(class: ObjectClass) -> arbor_proto::DynamicClassification {
    match class {
        ObjectClass::Static => arbor_proto::DynamicClassification::Static,
        ObjectClass::Dynamic => arbor_proto::DynamicClassification::Dynamic,
    }
}
