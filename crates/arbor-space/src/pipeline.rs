// SPDX-License-Identifier: Apache-2.0
//! Turns coalesced query events into framed result packets plus the
//! loc-subscription side effects, assigning per-client sequence numbers at
//! emission time.

use crate::worker::{classification, MainTask};
use arbor_geom::{AggregateBounds, SimTime, TimedMotion, TimedRotation};
use arbor_loc::{ClientId, IndexId, LocationCache};
use arbor_prox::{EntryKind, ObjectClass, Permanence, QueryEvent, QueryHandler};
use arbor_proto::{
    wire, AdditionType, IndexProperties, Message, ObjectAddition, ObjectRemoval,
    ProximityResults, ProximityUpdate, RemovalType,
};
use bytes::Bytes;
use glam::Vec3;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Per-drain framing context.
pub struct FrameContext<'a> {
    /// Destination client.
    pub client: ClientId,
    /// Object class of the originating handler.
    pub class: ObjectClass,
    /// Tree-local index identifier.
    pub index_id: IndexId,
    /// Origin-server identifier for root announcements.
    pub server_id: &'a str,
    /// Frame timestamp.
    pub now: SimTime,
    /// Entry budget per frame. Events are packed whole, so a frame may
    /// overshoot by the tail of its last event.
    pub max_per_result: usize,
}

/// Builds the ordered main-loop task list for one query's coalesced
/// events: subscription changes first for each entry, then the frame that
/// carries it, so installations observe event order.
pub fn build_tasks(
    ctx: &FrameContext<'_>,
    mut events: VecDeque<QueryEvent>,
    handler: &QueryHandler,
    loc: &LocationCache,
    seqnos: &AtomicU64,
) -> Vec<MainTask> {
    let mut tasks = Vec::new();
    while !events.is_empty() {
        let mut frame = ProximityResults {
            t: ctx.now.as_micros(),
            updates: Vec::new(),
        };
        let mut count = 0usize;
        while count < ctx.max_per_result {
            let Some(ev) = events.pop_front() else {
                break;
            };
            let mut update = ProximityUpdate {
                index_properties: IndexProperties {
                    id: ctx.index_id.0,
                    index_id: None,
                    dynamic_classification: None,
                },
                additions: Vec::new(),
                removals: Vec::new(),
            };
            if ev.is_root_announcement() {
                update.index_properties.index_id = Some(ctx.server_id.to_string());
                update.index_properties.dynamic_classification = Some(classification(ctx.class));
            }

            for a in ev.additions {
                let Some((location, orientation, bounds, mesh, physics)) =
                    addition_payload(ctx.now, a.id, a.kind, handler, loc)
                else {
                    // The cache already lost it; nothing useful to announce.
                    continue;
                };
                count += 1;
                tasks.push(MainTask::AddLocSubscription {
                    client: ctx.client,
                    observed: a.id,
                    index: ctx.index_id,
                });
                let seqno = seqnos.fetch_add(1, Ordering::Relaxed);
                update.additions.push(ObjectAddition {
                    object: a.id,
                    parent: a.parent,
                    seqno,
                    location,
                    orientation,
                    aggregate_bounds: bounds,
                    mesh,
                    physics,
                    kind: match a.kind {
                        EntryKind::Object => AdditionType::Object,
                        EntryKind::Aggregate => AdditionType::Aggregate,
                    },
                });
            }
            for r in ev.removals {
                count += 1;
                tasks.push(MainTask::RemoveLocSubscription {
                    client: ctx.client,
                    observed: r.id,
                    index: ctx.index_id,
                });
                let seqno = seqnos.fetch_add(1, Ordering::Relaxed);
                update.removals.push(ObjectRemoval {
                    object: r.id,
                    seqno,
                    kind: match r.permanence {
                        Permanence::Permanent => RemovalType::Permanent,
                        Permanence::Transient => RemovalType::Transient,
                    },
                });
            }
            if !update.additions.is_empty() || !update.removals.is_empty() {
                frame.updates.push(update);
            }
        }
        if frame.updates.is_empty() {
            continue;
        }
        match wire::encode_message(&Message::Results(frame), ctx.now.as_micros()) {
            Ok(bytes) => tasks.push(MainTask::SendResult {
                client: ctx.client,
                frame: Bytes::from(bytes),
            }),
            Err(err) => warn!(%err, client = %ctx.client, "failed to encode result frame"),
        }
    }
    tasks
}

type AdditionPayload = (
    TimedMotion,
    TimedRotation,
    AggregateBounds,
    Option<String>,
    Option<String>,
);

/// Location data for an addition: leaves (and mirrored aggregates) come
/// from the cache; unmirrored aggregates fall back to the tree's own
/// bounding sphere.
fn addition_payload(
    now: SimTime,
    id: arbor_loc::ObjectId,
    kind: EntryKind,
    handler: &QueryHandler,
    loc: &LocationCache,
) -> Option<AdditionPayload> {
    if let Some(rec) = loc.location(id) {
        return Some((
            rec.motion,
            rec.rotation,
            rec.bounds,
            rec.mesh.clone(),
            rec.physics.clone(),
        ));
    }
    if kind == EntryKind::Aggregate {
        let view = handler.node_view(id)?;
        return Some((
            TimedMotion::stationary(now, view.bounds.center),
            TimedRotation::identity(now),
            AggregateBounds::new(Vec3::ZERO, view.bounds.radius, 0.0),
            None,
            None,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{ProxWorker, SimClock, WorkerMsg};
    use arbor_loc::{LocRecord, ObjectId};
    use arbor_prox::{ProxConfig, ProxEngine};
    use arbor_proto::{AdditionType, DynamicClassification};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const CLIENT: ClientId = ClientId(1);

    fn record(pos: Vec3) -> LocRecord {
        LocRecord {
            motion: TimedMotion::stationary(SimTime::ZERO, pos),
            rotation: TimedRotation::identity(SimTime::ZERO),
            bounds: AggregateBounds::exact(1.0),
            mesh: Some("meerkat:///box.dae".into()),
            physics: None,
            is_aggregate: false,
            is_local: true,
        }
    }

    fn worker_fixture(
        objects: usize,
    ) -> (
        Arc<LocationCache>,
        ProxWorker,
        UnboundedReceiver<crate::worker::MainTask>,
        Vec<ObjectId>,
    ) {
        let loc = Arc::new(LocationCache::new());
        let mut engine = ProxEngine::new(ProxConfig::default(), loc.clone()).unwrap();
        let ids: Vec<ObjectId> = (0..objects)
            .map(|i| {
                let id = ObjectId::random();
                #[allow(clippy::cast_precision_loss)]
                loc.track(id, record(Vec3::new(i as f32 * 4.0, 0.0, 0.0)));
                engine.add_object(id);
                id
            })
            .collect();
        let (main_tx, main_rx) = tokio::sync::mpsc::unbounded_channel();
        let worker = ProxWorker::new(
            engine,
            loc.clone(),
            Arc::new(SimClock::new()),
            "1".to_string(),
            Duration::from_millis(100),
            main_tx,
        );
        (loc, worker, main_rx, ids)
    }

    fn bundle() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    fn drain_tasks(rx: &mut UnboundedReceiver<crate::worker::MainTask>) -> Vec<crate::worker::MainTask> {
        let mut out = Vec::new();
        while let Ok(task) = rx.try_recv() {
            out.push(task);
        }
        out
    }

    fn decode_frames(tasks: &[crate::worker::MainTask]) -> Vec<ProximityResults> {
        tasks
            .iter()
            .filter_map(|t| match t {
                crate::worker::MainTask::SendResult { frame, .. } => {
                    match wire::decode_message(frame).unwrap() {
                        (Message::Results(r), _, _) => Some(r),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    fn wire_seqnos(frames: &[ProximityResults]) -> Vec<u64> {
        let mut out = Vec::new();
        for f in frames {
            for u in &f.updates {
                for a in &u.additions {
                    out.push(a.seqno);
                }
                for r in &u.removals {
                    out.push(r.seqno);
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn init_frame_is_a_lone_static_root_announcement_with_seqno_zero() {
        let (_loc, mut worker, mut rx, _ids) = worker_fixture(3);
        let seqnos = bundle();
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: r#"{"action":"init"}"#.into(),
            seqnos,
        });
        worker.engine().tick(SimTime::from_micros(1));
        worker.flush_results();

        let tasks = drain_tasks(&mut rx);
        // Subscription installation precedes the frame that caused it.
        assert!(matches!(
            tasks.first(),
            Some(crate::worker::MainTask::AddLocSubscription { .. })
        ));
        let frames = decode_frames(&tasks);
        assert_eq!(frames.len(), 1);
        let update = &frames[0].updates[0];
        assert_eq!(update.additions.len(), 1);
        assert!(update.removals.is_empty());
        let addition = &update.additions[0];
        assert_eq!(addition.seqno, 0);
        assert_eq!(addition.parent, None);
        assert_eq!(addition.kind, AdditionType::Aggregate);
        assert_eq!(update.index_properties.id, 0);
        assert_eq!(update.index_properties.index_id.as_deref(), Some("1"));
        assert_eq!(
            update.index_properties.dynamic_classification,
            Some(DynamicClassification::Static)
        );
    }

    #[tokio::test]
    async fn sequence_numbers_stay_dense_across_refines() {
        let (_loc, mut worker, mut rx, _ids) = worker_fixture(3);
        let seqnos = bundle();
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: r#"{"action":"init"}"#.into(),
            seqnos: seqnos.clone(),
        });
        worker.engine().tick(SimTime::from_micros(1));
        worker.flush_results();
        let root_frames = decode_frames(&drain_tasks(&mut rx));
        let root = root_frames[0].updates[0].additions[0].object;

        let refine = format!(r#"{{"action":"refine","nodes":["{root}"]}}"#);
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: refine,
            seqnos: seqnos.clone(),
        });
        worker.flush_results();
        let frames = decode_frames(&drain_tasks(&mut rx));
        let seqnos_on_wire = wire_seqnos(&frames);
        assert_eq!(seqnos_on_wire, vec![1, 2, 3], "dense and in wire order");
        for a in frames.iter().flat_map(|f| f.updates.iter()).flat_map(|u| u.additions.iter()) {
            assert_eq!(a.parent, Some(root));
            assert_eq!(a.kind, AdditionType::Object);
            assert_eq!(a.mesh.as_deref(), Some("meerkat:///box.dae"));
        }
    }

    #[tokio::test]
    async fn leaves_the_cache_lost_are_skipped_without_consuming_seqnos() {
        let (loc, mut worker, mut rx, ids) = worker_fixture(3);
        let seqnos = bundle();
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: r#"{"action":"init"}"#.into(),
            seqnos: seqnos.clone(),
        });
        worker.engine().tick(SimTime::from_micros(1));
        worker.flush_results();
        let root = decode_frames(&drain_tasks(&mut rx))[0].updates[0].additions[0].object;

        // Drop one object from the cache only; the index still holds it.
        loc.untrack(ids[0]);
        let refine = format!(r#"{{"action":"refine","nodes":["{root}"]}}"#);
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: refine,
            seqnos: seqnos.clone(),
        });
        worker.flush_results();
        let frames = decode_frames(&drain_tasks(&mut rx));
        let announced: Vec<_> = frames
            .iter()
            .flat_map(|f| f.updates.iter())
            .flat_map(|u| u.additions.iter())
            .collect();
        assert_eq!(announced.len(), 2, "the lost leaf is skipped");
        assert_eq!(wire_seqnos(&frames), vec![1, 2], "no gap for the skip");
    }

    #[tokio::test]
    async fn destroy_erases_the_bundle_and_removes_subscriptions() {
        let (_loc, mut worker, mut rx, _ids) = worker_fixture(2);
        let seqnos = bundle();
        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: r#"{"action":"init"}"#.into(),
            seqnos: seqnos.clone(),
        });
        worker.engine().tick(SimTime::from_micros(1));
        worker.flush_results();
        drain_tasks(&mut rx);

        worker.handle(WorkerMsg::Command {
            client: CLIENT,
            params: r#"{"action":"destroy"}"#.into(),
            seqnos,
        });
        worker.flush_results();
        let tasks = drain_tasks(&mut rx);
        assert!(tasks.iter().any(|t| matches!(
            t,
            crate::worker::MainTask::RemoveAllLocSubscriptions { client } if *client == CLIENT
        )));
        assert!(decode_frames(&tasks).is_empty());
    }
}
