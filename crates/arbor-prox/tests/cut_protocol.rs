//! Scenario tests for the cut protocol: init announcements, refine and
//! coarsen flows, class swaps, and client teardown, driven through the
//! public engine API with a hand-rolled clock.

use arbor_geom::{AggregateBounds, SimTime, TimedMotion, TimedRotation};
use arbor_loc::{ClientId, LocRecord, LocationCache, ObjectId};
use arbor_prox::{
    coalesce, DrainedQuery, EntryKind, ObjectClass, Permanence, ProxConfig, ProxEngine,
};
use glam::Vec3;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const CLIENT: ClientId = ClientId(1);

fn t(ms: u64) -> SimTime {
    SimTime::from_micros(ms * 1_000)
}

fn config() -> ProxConfig {
    ProxConfig {
        move_to_static_delay: Duration::from_millis(100),
        ..ProxConfig::default()
    }
}

fn track(cache: &LocationCache, pos: Vec3, vel: Vec3) -> ObjectId {
    let id = ObjectId::random();
    cache.track(
        id,
        LocRecord {
            motion: TimedMotion {
                t: SimTime::ZERO,
                position: pos,
                velocity: vel,
            },
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

fn drained_for(engine: &mut ProxEngine, client: ClientId) -> Vec<DrainedQuery> {
    engine
        .drain_events()
        .into_iter()
        .filter(|d| d.client == client)
        .collect()
}

/// Walks `engine`'s tree for `class` and asserts no two cut-refcounted
/// nodes sit on one ancestor line (the I2 frontier invariant, visible
/// through node introspection when a single query is registered).
fn assert_frontier_invariant(engine: &ProxEngine, class: ObjectClass) {
    let nodes = engine.nodes(class).unwrap();
    let parents: HashMap<ObjectId, Option<ObjectId>> =
        nodes.iter().map(|n| (n.id, n.parent)).collect();
    let on_cut: HashSet<ObjectId> = nodes.iter().filter(|n| n.cuts > 0).map(|n| n.id).collect();
    for &member in &on_cut {
        let mut cur = parents.get(&member).copied().flatten();
        while let Some(ancestor) = cur {
            assert!(
                !on_cut.contains(&ancestor),
                "cut member {member} has ancestor {ancestor} also on the cut"
            );
            cur = parents.get(&ancestor).copied().flatten();
        }
    }
}

#[test]
fn init_produces_a_lone_static_root_announcement() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    for i in 0..3u8 {
        let id = track(&cache, Vec3::new(f32::from(i) * 4.0, 0.0, 0.0), Vec3::ZERO);
        engine.add_object(id);
    }

    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));

    let drained = drained_for(&mut engine, CLIENT);
    assert_eq!(drained.len(), 1, "only the static index has a root");
    let d = &drained[0];
    assert_eq!(d.class, ObjectClass::Static);
    assert_eq!(d.events.len(), 1);
    let ev = &d.events[0];
    assert!(ev.is_root_announcement());
    assert_eq!(ev.additions[0].kind, EntryKind::Aggregate);
    assert_eq!(ev.additions[0].parent, None);
}

#[test]
fn refining_the_root_announces_every_child_with_the_root_as_parent() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    let ids: HashSet<ObjectId> = (0..3u8)
        .map(|i| {
            let id = track(&cache, Vec3::new(f32::from(i) * 4.0, 0.0, 0.0), Vec3::ZERO);
            engine.add_object(id);
            id
        })
        .collect();

    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    let root = engine.handler(ObjectClass::Static).unwrap().root_uuid().unwrap();
    drained_for(&mut engine, CLIENT); // consume the announcement

    engine.refine_nodes(CLIENT, &[root]);
    let drained = drained_for(&mut engine, CLIENT);
    assert_eq!(drained.len(), 1);
    let ev = &drained[0].events[0];
    assert_eq!(ev.removals.len(), 0);
    let announced: HashSet<ObjectId> = ev.additions.iter().map(|a| a.id).collect();
    assert_eq!(announced, ids);
    for a in &ev.additions {
        assert_eq!(a.parent, Some(root));
        assert_eq!(a.kind, EntryKind::Object);
    }
    assert_frontier_invariant(&engine, ObjectClass::Static);
}

#[test]
fn speeding_up_emits_static_removal_before_dynamic_addition() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();

    // One resident per class so both trees exist and can be refined.
    let a = track(&cache, Vec3::ZERO, Vec3::ZERO);
    let anchor_static = track(&cache, Vec3::new(8.0, 0.0, 0.0), Vec3::ZERO);
    let anchor_dynamic = track(&cache, Vec3::new(-8.0, 0.0, 0.0), Vec3::new(3.0, 0.0, 0.0));
    for id in [a, anchor_static, anchor_dynamic] {
        engine.add_object(id);
    }

    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    let static_root = engine.handler(ObjectClass::Static).unwrap().root_uuid().unwrap();
    let dynamic_root = engine.handler(ObjectClass::Dynamic).unwrap().root_uuid().unwrap();
    drained_for(&mut engine, CLIENT);
    engine.refine_nodes(CLIENT, &[static_root, dynamic_root]);
    drained_for(&mut engine, CLIENT);

    // A starts moving: immediate swap to the dynamic index.
    let moving = TimedMotion {
        t: t(200),
        position: Vec3::ZERO,
        velocity: Vec3::new(5.0, 0.0, 0.0),
    };
    cache.update_motion(a, moving).unwrap();
    engine.on_location_updated(true, a, &moving, t(200));
    engine.tick(t(300));

    let drained = drained_for(&mut engine, CLIENT);
    let removal_pos = drained
        .iter()
        .position(|d| {
            d.class == ObjectClass::Static
                && d.events.iter().any(|e| e.removals.iter().any(|r| {
                    r.id == a && r.permanence == Permanence::Transient
                }))
        })
        .expect("transient removal of A from the static index");
    let addition_pos = drained
        .iter()
        .position(|d| {
            d.class == ObjectClass::Dynamic
                && d.events.iter().any(|e| e.additions.iter().any(|x| x.id == a))
        })
        .expect("addition of A to the dynamic index");
    assert!(removal_pos < addition_pos, "removal must precede addition");

    // A stops again: after the dwell delay it swaps back.
    let still = TimedMotion::stationary(t(400), Vec3::ZERO);
    cache.update_motion(a, still).unwrap();
    engine.on_location_updated(true, a, &still, t(400));
    engine.tick(t(450)); // dwell not yet elapsed
    assert!(engine
        .handler(ObjectClass::Dynamic)
        .unwrap()
        .contains_object(a));

    engine.tick(t(501)); // dwell elapsed
    assert!(engine
        .handler(ObjectClass::Static)
        .unwrap()
        .contains_object(a));
    assert!(!engine
        .handler(ObjectClass::Dynamic)
        .unwrap()
        .contains_object(a));
    let drained = drained_for(&mut engine, CLIENT);
    assert!(drained.iter().any(|d| d.class == ObjectClass::Dynamic
        && d.events.iter().any(|e| e.removals.iter().any(|r| r.id == a))));
    assert!(drained.iter().any(|d| d.class == ObjectClass::Static
        && d.events.iter().any(|e| e.additions.iter().any(|x| x.id == a))));
}

#[test]
fn refine_then_coarsen_coalesces_to_nothing_and_restores_the_cut() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    for i in 0..4u8 {
        let id = track(&cache, Vec3::new(f32::from(i) * 5.0, 0.0, 0.0), Vec3::ZERO);
        engine.add_object(id);
    }
    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    let root = engine.handler(ObjectClass::Static).unwrap().root_uuid().unwrap();
    drained_for(&mut engine, CLIENT);

    engine.refine_nodes(CLIENT, &[root]);
    engine.coarsen_nodes(CLIENT, &[root]);

    let drained = drained_for(&mut engine, CLIENT);
    let max = engine.config().max_per_result;
    for d in drained {
        assert!(
            coalesce(d.events, max).is_empty(),
            "refine followed by coarsen must have no net effect"
        );
    }

    // The cut is back to exactly the root.
    let nodes = engine.nodes(ObjectClass::Static).unwrap();
    for n in &nodes {
        let expected = u32::from(n.id == root);
        assert_eq!(n.cuts, expected, "node {} cut refcount", n.id);
    }
    assert_frontier_invariant(&engine, ObjectClass::Static);
}

#[test]
fn churn_under_a_refined_cut_joins_new_objects_to_the_frontier() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    for i in 0..2u8 {
        let id = track(&cache, Vec3::new(f32::from(i) * 5.0, 0.0, 0.0), Vec3::ZERO);
        engine.add_object(id);
    }
    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    let root = engine.handler(ObjectClass::Static).unwrap().root_uuid().unwrap();
    drained_for(&mut engine, CLIENT);
    engine.refine_nodes(CLIENT, &[root]);
    drained_for(&mut engine, CLIENT);

    // A new object arrives below the frontier: it must be announced.
    let newcomer = track(&cache, Vec3::new(2.5, 0.0, 0.0), Vec3::ZERO);
    engine.add_object(newcomer);
    let drained = drained_for(&mut engine, CLIENT);
    assert!(drained.iter().any(|d| d
        .events
        .iter()
        .any(|e| e.additions.iter().any(|a| a.id == newcomer))));
    assert_frontier_invariant(&engine, ObjectClass::Static);

    // While a coarse client (cut at the root) hears nothing.
    let other = ClientId(2);
    engine.init_client(other, t(200));
    engine.tick(t(300));
    drained_for(&mut engine, other);
    let late = track(&cache, Vec3::new(3.5, 0.0, 0.0), Vec3::ZERO);
    engine.add_object(late);
    assert!(drained_for(&mut engine, other).is_empty());
}

#[test]
fn removing_a_refined_object_emits_a_permanent_removal() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    let ids: Vec<ObjectId> = (0..3u8)
        .map(|i| {
            let id = track(&cache, Vec3::new(f32::from(i) * 5.0, 0.0, 0.0), Vec3::ZERO);
            engine.add_object(id);
            id
        })
        .collect();
    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    let root = engine.handler(ObjectClass::Static).unwrap().root_uuid().unwrap();
    drained_for(&mut engine, CLIENT);
    engine.refine_nodes(CLIENT, &[root]);
    drained_for(&mut engine, CLIENT);

    cache.untrack(ids[0]);
    engine.remove_object(ids[0], true);
    let drained = drained_for(&mut engine, CLIENT);
    let removal = drained
        .iter()
        .flat_map(|d| d.events.iter())
        .flat_map(|e| e.removals.iter())
        .find(|r| r.id == ids[0])
        .expect("removal of the untracked object");
    assert_eq!(removal.permanence, Permanence::Permanent);
}

#[test]
fn destroying_a_client_silences_and_forgets_its_queries() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    for i in 0..3u8 {
        let id = track(&cache, Vec3::new(f32::from(i) * 5.0, 0.0, 0.0), Vec3::ZERO);
        engine.add_object(id);
    }
    engine.init_client(CLIENT, t(0));
    engine.tick(t(100));
    assert_eq!(engine.client_queries(CLIENT).len(), 2);

    assert!(engine.destroy_client(CLIENT));
    assert!(engine.client_queries(CLIENT).is_empty());
    assert!(drained_for(&mut engine, CLIENT).is_empty());

    // Churn after destruction emits nothing for the departed client.
    let late = track(&cache, Vec3::new(30.0, 0.0, 0.0), Vec3::ZERO);
    engine.add_object(late);
    engine.tick(t(200));
    assert!(drained_for(&mut engine, CLIENT).is_empty());
    assert!(!engine.destroy_client(CLIENT));
}

#[test]
fn replicas_are_refused_by_local_only_handlers() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    let replica = ObjectId::random();
    cache.track(
        replica,
        LocRecord {
            motion: TimedMotion::stationary(SimTime::ZERO, Vec3::ZERO),
            rotation: TimedRotation::identity(SimTime::ZERO),
            bounds: AggregateBounds::exact(1.0),
            mesh: None,
            physics: None,
            is_aggregate: false,
            is_local: false,
        },
    );
    engine.add_object(replica);
    assert!(!engine.contains_object(replica));
}

#[test]
fn an_object_is_never_in_both_indexes_between_ticks() {
    let cache = Arc::new(LocationCache::new());
    let mut engine = ProxEngine::new(config(), cache.clone()).unwrap();
    let a = track(&cache, Vec3::ZERO, Vec3::ZERO);
    engine.add_object(a);

    let check = |engine: &ProxEngine| {
        let in_static = engine.handler(ObjectClass::Static).unwrap().contains_object(a);
        let in_dynamic = engine.handler(ObjectClass::Dynamic).unwrap().contains_object(a);
        assert!(!(in_static && in_dynamic), "object in both indexes");
    };

    check(&engine);
    let moving = TimedMotion {
        t: t(10),
        position: Vec3::ZERO,
        velocity: Vec3::new(4.0, 0.0, 0.0),
    };
    cache.update_motion(a, moving).unwrap();
    engine.on_location_updated(true, a, &moving, t(10));
    check(&engine);
    engine.tick(t(20));
    check(&engine);
    let still = TimedMotion::stationary(t(30), Vec3::ZERO);
    cache.update_motion(a, still).unwrap();
    engine.on_location_updated(true, a, &still, t(30));
    engine.tick(t(200));
    check(&engine);
}
