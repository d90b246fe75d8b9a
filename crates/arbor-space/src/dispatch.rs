// SPDX-License-Identifier: Apache-2.0
//! Routes parsed query commands to the engine. Runs on the worker thread;
//! protocol garbage never makes it past the parser, so nothing here can
//! take the worker down.

use arbor_geom::SimTime;
use arbor_loc::ClientId;
use arbor_prox::ProxEngine;
use arbor_proto::command::{parse_command, QueryCommand};
use tracing::debug;

/// What a command did, so the worker can clean up after `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command was malformed or unknown and was dropped.
    Ignored,
    /// The command was applied.
    Handled,
    /// The client's queries were torn down.
    Destroyed,
}

/// Parses and applies one `query_parameters` body for `client`.
pub fn apply(
    engine: &mut ProxEngine,
    client: ClientId,
    raw: &str,
    now: SimTime,
) -> CommandOutcome {
    match parse_command(raw) {
        None => CommandOutcome::Ignored,
        Some(QueryCommand::Init) => {
            debug!(%client, "init query");
            engine.init_client(client, now);
            CommandOutcome::Handled
        }
        Some(QueryCommand::Refine(nodes)) => {
            debug!(%client, nodes = nodes.len(), "refine query");
            engine.refine_nodes(client, &nodes);
            CommandOutcome::Handled
        }
        Some(QueryCommand::Coarsen(nodes)) => {
            debug!(%client, nodes = nodes.len(), "coarsen query");
            engine.coarsen_nodes(client, &nodes);
            CommandOutcome::Handled
        }
        Some(QueryCommand::Destroy) => {
            debug!(%client, "destroy query");
            engine.destroy_client(client);
            CommandOutcome::Destroyed
        }
    }
}
