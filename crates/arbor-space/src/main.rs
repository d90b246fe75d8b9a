// SPDX-License-Identifier: Apache-2.0
//! The arbor space server binary.
//!
//! Two cooperating single-threaded event loops: the tokio current-thread
//! runtime handles transport I/O, location cache writes, subscription
//! installation, and session lifetime; a dedicated "prox" thread runs the
//! proximity engine. The loops talk only through queues.

mod config;
mod control;
mod dispatch;
mod pipeline;
mod session;
mod worker;

use crate::config::Options;
use crate::session::SessionRegistry;
use crate::worker::{
    AggregateMirror, LocForwarder, MainTask, ProxWorker, SimClock,
};
use anyhow::Context;
use arbor_geom::TimedRotation;
use arbor_loc::{LocRecord, LocationCache};
use arbor_prox::{ObjectClass, ProxEngine};
use clap::Parser;
use std::sync::{mpsc, Arc};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = Options::parse();
    let cfg = opts.prox_config();
    cfg.validate().context("invalid proximity configuration")?;

    let loc = Arc::new(LocationCache::new());
    let clock = Arc::new(SimClock::new());
    let (worker_tx, worker_rx) = mpsc::channel();
    let (main_tx, mut main_rx) = tokio::sync::mpsc::unbounded_channel::<MainTask>();

    loc.add_listener(Box::new(LocForwarder::new(worker_tx.clone())));

    let mut engine = ProxEngine::new(cfg, loc.clone())?;
    // Dynamic aggregates are not useful for meshing; only the static index
    // mirrors its aggregates into the cache.
    engine.set_aggregate_listener(
        ObjectClass::Static,
        Box::new(AggregateMirror::new(main_tx.clone(), clock.clone())),
    );

    let prox = ProxWorker::new(
        engine,
        loc.clone(),
        clock.clone(),
        opts.server_id.clone(),
        opts.tick_interval(),
        main_tx,
    );
    let _prox_thread = worker::spawn(prox, worker_rx).context("failed to spawn the prox worker")?;

    let registry = Arc::new(SessionRegistry::new());

    // Pump worker results and subscription changes into the main loop's
    // owned state.
    {
        let registry = registry.clone();
        let loc = loc.clone();
        tokio::spawn(async move {
            while let Some(task) = main_rx.recv().await {
                apply_main_task(task, &registry, &loc).await;
            }
        });
    }

    let control_listener = TcpListener::bind(opts.control)
        .await
        .with_context(|| format!("failed to bind control listener on {}", opts.control))?;
    info!(addr = %opts.control, "control listener ready");
    tokio::spawn(control::run(
        control_listener,
        worker_tx.clone(),
        registry.clone(),
        loc.clone(),
        clock.clone(),
    ));

    let session_listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("failed to bind session listener on {}", opts.listen))?;
    info!(addr = %opts.listen, server_id = %opts.server_id, "proximity session listener ready");

    loop {
        let (stream, _) = session_listener.accept().await?;
        let registry = registry.clone();
        let worker_tx = worker_tx.clone();
        tokio::spawn(session::handle_client(stream, registry, worker_tx));
    }
}

async fn apply_main_task(task: MainTask, registry: &Arc<SessionRegistry>, loc: &LocationCache) {
    match task {
        MainTask::SendResult { client, frame } => {
            registry.send(client, frame).await;
        }
        MainTask::AddLocSubscription {
            client,
            observed,
            index,
        } => {
            loc.add_subscription(client, observed, index);
        }
        MainTask::RemoveLocSubscription {
            client,
            observed,
            index,
        } => {
            loc.remove_subscription(client, observed, index);
        }
        MainTask::RemoveAllLocSubscriptions { client } => {
            loc.remove_all_subscriptions(client);
        }
        MainTask::TrackAggregate { id, motion, bounds } => {
            loc.track(
                id,
                LocRecord {
                    motion,
                    rotation: TimedRotation::identity(motion.t),
                    bounds,
                    mesh: None,
                    physics: None,
                    is_aggregate: true,
                    is_local: true,
                },
            );
        }
        MainTask::UpdateAggregate { id, motion, bounds } => {
            let _ = loc.update_motion(id, motion);
            let _ = loc.update_bounds(id, bounds);
        }
        MainTask::UntrackAggregate { id } => {
            loc.untrack(id);
        }
    }
}
