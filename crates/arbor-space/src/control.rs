// SPDX-License-Identifier: Apache-2.0
//! Control/introspection surface: newline-delimited JSON over a separate
//! listener.
//!
//! Introspection commands (`properties`, `list_handlers`, `list_nodes`,
//! `force_rebuild`) are forwarded to the worker, which reads the engine
//! directly. World-ingest commands (`track_object`, `update_location`,
//! `untrack_object`) stand in for the location service and run on the main
//! loop, where cache writes belong.

use crate::session::SessionRegistry;
use crate::worker::{SimClock, WorkerMsg};
use arbor_geom::{AggregateBounds, TimedMotion, TimedRotation};
use arbor_loc::{LocRecord, LocationCache, ObjectId};
use arbor_prox::{ObjectClass, ProxEngine};
use glam::Vec3;
use serde_json::{json, Map, Value};
use std::sync::{mpsc, Arc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// An introspection request forwarded to the worker.
pub struct ControlRequest {
    /// Command name.
    pub command: String,
    /// Remaining fields of the request object.
    pub args: Map<String, Value>,
    /// Reply channel back to the control task.
    pub reply: oneshot::Sender<Value>,
}

/// Executes an introspection command against the engine. Runs on the
/// worker thread.
pub fn execute_introspection(
    engine: &ProxEngine,
    command: &str,
    args: &Map<String, Value>,
) -> Value {
    match command {
        "properties" => {
            let cfg = engine.config();
            let mut out = Map::new();
            out.insert("name".into(), json!("arbor-manual"));
            out.insert("settings.handlers".into(), json!(cfg.handlers_per_tree));
            out.insert(
                "settings.dynamic_separate".into(),
                json!(cfg.separate_dynamic_objects),
            );
            if cfg.separate_dynamic_objects {
                out.insert(
                    "settings.static_heuristic".into(),
                    json!(format!("{:?}", cfg.move_to_static_delay)),
                );
            }
            let count = engine.num_objects();
            out.insert("objects.properties.local_count".into(), json!(count));
            out.insert("objects.properties.remote_count".into(), json!(0));
            out.insert("objects.properties.count".into(), json!(count));
            let oh_queries = engine
                .handler(ObjectClass::Static)
                .map_or(0, arbor_prox::QueryHandler::num_queries);
            out.insert("queries.oh.count".into(), json!(oh_queries));
            out.insert(
                "queries.oh.timeouts".into(),
                json!(engine.classifier_pending()),
            );
            Value::Object(out)
        }
        "list_handlers" => {
            let mut out = Map::new();
            for class in engine.classes() {
                let Some(h) = engine.handler(class) else {
                    continue;
                };
                let key = format!("handlers.oh.{}.", class.label());
                out.insert(format!("{key}name"), json!(class.handler_name()));
                out.insert(format!("{key}queries"), json!(h.num_queries()));
                out.insert(format!("{key}objects"), json!(h.num_objects()));
                out.insert(format!("{key}nodes"), json!(h.num_nodes()));
            }
            Value::Object(out)
        }
        "list_nodes" => match parse_handler(engine, args) {
            Some(class) => {
                let nodes: Vec<Value> = engine
                    .nodes(class)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| {
                        json!({
                            "id": n.id.to_string(),
                            "parent": n.parent.map(|p| p.to_string()),
                            "bounds.center.x": n.bounds.center.x,
                            "bounds.center.y": n.bounds.center.y,
                            "bounds.center.z": n.bounds.center.z,
                            "bounds.radius": n.bounds.radius,
                            "cuts": n.cuts,
                        })
                    })
                    .collect();
                json!({ "nodes": nodes })
            }
            None => ill_formatted_handler(),
        },
        "force_rebuild" => match parse_handler(engine, args) {
            Some(_) => json!({ "error": "rebuilding not supported" }),
            None => ill_formatted_handler(),
        },
        other => json!({ "error": format!("unknown command {other:?}") }),
    }
}

fn parse_handler(engine: &ProxEngine, args: &Map<String, Value>) -> Option<ObjectClass> {
    let name = args.get("handler")?.as_str()?;
    let class = ObjectClass::parse_handler_name(name)?;
    engine.handler(class).map(|_| class)
}

fn ill_formatted_handler() -> Value {
    json!({ "error": "Ill-formatted request: handler not specified or invalid." })
}

/// Runs the control listener until the process exits.
pub async fn run(
    listener: TcpListener,
    worker_tx: mpsc::Sender<WorkerMsg>,
    registry: Arc<SessionRegistry>,
    loc: Arc<LocationCache>,
    clock: Arc<SimClock>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "control accept failed");
                continue;
            }
        };
        let worker_tx = worker_tx.clone();
        let registry = registry.clone();
        let loc = loc.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(stream, worker_tx, registry, loc, clock).await {
                info!(%err, "control connection ended");
            }
        });
    }
}

async fn handle_conn(
    stream: TcpStream,
    worker_tx: mpsc::Sender<WorkerMsg>,
    registry: Arc<SessionRegistry>,
    loc: Arc<LocationCache>,
    clock: Arc<SimClock>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch_line(&line, &worker_tx, &registry, &loc, &clock).await;
        let mut bytes = reply.to_string().into_bytes();
        bytes.push(b'\n');
        write.write_all(&bytes).await?;
    }
    Ok(())
}

async fn dispatch_line(
    line: &str,
    worker_tx: &mpsc::Sender<WorkerMsg>,
    registry: &Arc<SessionRegistry>,
    loc: &Arc<LocationCache>,
    clock: &Arc<SimClock>,
) -> Value {
    let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(line) else {
        return json!({ "error": "expected a JSON object" });
    };
    let Some(command) = obj.remove("command").and_then(|v| match v {
        Value::String(s) => Some(s),
        _ => None,
    }) else {
        return json!({ "error": "missing command field" });
    };

    match command.as_str() {
        "track_object" => track_object(&obj, loc, clock),
        "update_location" => update_location(&obj, loc, clock),
        "untrack_object" => match object_arg(&obj) {
            Some(id) => json!({ "untracked": loc.untrack(id) }),
            None => json!({ "error": "missing or invalid object field" }),
        },
        introspection => {
            let (tx, rx) = oneshot::channel();
            let req = ControlRequest {
                command: introspection.to_string(),
                args: obj,
                reply: tx,
            };
            if worker_tx.send(WorkerMsg::Control(req)).is_err() {
                return json!({ "error": "worker unavailable" });
            }
            let mut reply = match rx.await {
                Ok(v) => v,
                Err(_) => return json!({ "error": "worker dropped the request" }),
            };
            if introspection == "properties" {
                if let Value::Object(map) = &mut reply {
                    map.insert(
                        "queries.oh.messages".into(),
                        json!(registry.queued_frames().await),
                    );
                    map.insert("queries.oh.sessions".into(), json!(registry.len().await));
                }
            }
            reply
        }
    }
}

fn object_arg(args: &Map<String, Value>) -> Option<ObjectId> {
    args.get("object")?.as_str()?.parse().ok()
}

#[allow(clippy::cast_possible_truncation)]
fn vec3_arg(args: &Map<String, Value>, key: &str) -> Option<Vec3> {
    let arr = args.get(key)?.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    let mut out = [0.0f32; 3];
    for (slot, v) in out.iter_mut().zip(arr) {
        *slot = v.as_f64()? as f32;
    }
    Some(Vec3::from_array(out))
}

fn track_object(args: &Map<String, Value>, loc: &LocationCache, clock: &SimClock) -> Value {
    let id = object_arg(args).unwrap_or_else(ObjectId::random);
    let position = vec3_arg(args, "position").unwrap_or(Vec3::ZERO);
    let velocity = vec3_arg(args, "velocity").unwrap_or(Vec3::ZERO);
    #[allow(clippy::cast_possible_truncation)]
    let radius = args.get("radius").and_then(Value::as_f64).unwrap_or(1.0) as f32;
    let is_local = args.get("is_local").and_then(Value::as_bool).unwrap_or(true);
    let now = clock.now();
    let record = LocRecord {
        motion: TimedMotion {
            t: now,
            position,
            velocity,
        },
        rotation: TimedRotation::identity(now),
        bounds: AggregateBounds::exact(radius),
        mesh: args
            .get("mesh")
            .and_then(Value::as_str)
            .map(str::to_string),
        physics: args
            .get("physics")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_aggregate: false,
        is_local,
    };
    if loc.track(id, record) {
        json!({ "object": id.to_string() })
    } else {
        json!({ "error": "already tracked", "object": id.to_string() })
    }
}

fn update_location(args: &Map<String, Value>, loc: &LocationCache, clock: &SimClock) -> Value {
    let Some(id) = object_arg(args) else {
        return json!({ "error": "missing or invalid object field" });
    };
    let Some(current) = loc.location(id) else {
        return json!({ "error": "object is not tracked" });
    };
    let motion = TimedMotion {
        t: clock.now(),
        position: vec3_arg(args, "position").unwrap_or(current.motion.position),
        velocity: vec3_arg(args, "velocity").unwrap_or(current.motion.velocity),
    };
    match loc.update_motion(id, motion) {
        Ok(()) => json!({ "object": id.to_string() }),
        Err(err) => json!({ "error": err.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_prox::ProxConfig;

    fn engine() -> ProxEngine {
        let loc = Arc::new(LocationCache::new());
        ProxEngine::new(ProxConfig::default(), loc).unwrap()
    }

    #[test]
    fn properties_reports_name_and_settings() {
        let reply = execute_introspection(&engine(), "properties", &Map::new());
        assert_eq!(reply["name"], "arbor-manual");
        assert_eq!(reply["settings.handlers"], 2);
        assert_eq!(reply["settings.dynamic_separate"], true);
        assert_eq!(reply["objects.properties.count"], 0);
    }

    #[test]
    fn list_handlers_names_both_classes() {
        let reply = execute_introspection(&engine(), "list_handlers", &Map::new());
        assert_eq!(
            reply["handlers.oh.static.name"],
            "oh-queries.static-objects"
        );
        assert_eq!(
            reply["handlers.oh.dynamic.name"],
            "oh-queries.dynamic-objects"
        );
    }

    #[test]
    fn force_rebuild_is_refused() {
        let mut args = Map::new();
        args.insert("handler".into(), json!("oh-queries.static-objects"));
        let reply = execute_introspection(&engine(), "force_rebuild", &args);
        assert_eq!(reply["error"], "rebuilding not supported");
    }

    #[test]
    fn missing_handler_argument_is_ill_formatted() {
        for cmd in ["list_nodes", "force_rebuild"] {
            let reply = execute_introspection(&engine(), cmd, &Map::new());
            assert!(reply["error"]
                .as_str()
                .unwrap()
                .starts_with("Ill-formatted request"));
        }
        let mut args = Map::new();
        args.insert("handler".into(), json!("oh-queries.warp-objects"));
        let reply = execute_introspection(&engine(), "list_nodes", &args);
        assert!(reply["error"].as_str().unwrap().starts_with("Ill-formatted"));
    }

    #[test]
    fn unknown_commands_return_an_error() {
        let reply = execute_introspection(&engine(), "reticulate", &Map::new());
        assert!(reply["error"].as_str().unwrap().contains("unknown command"));
    }
}
