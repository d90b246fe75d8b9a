// SPDX-License-Identifier: Apache-2.0
//! Parsing of the JSON command bodies carried in `query_parameters`.
//!
//! Protocol errors never propagate: malformed JSON, missing fields, and
//! unknown actions are logged and swallowed so a misbehaving client cannot
//! disturb the worker.

use arbor_loc::ObjectId;
use serde_json::Value;
use tracing::{debug, warn};

/// A parsed query command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCommand {
    /// Allocate queries for the client.
    Init,
    /// Push the cut down through the listed nodes.
    Refine(Vec<ObjectId>),
    /// Pull the cut up onto the listed nodes.
    Coarsen(Vec<ObjectId>),
    /// Tear down the client's queries.
    Destroy,
}

/// Parses a `query_parameters` JSON body. Returns `None` for anything
/// malformed; the caller just drops the command.
#[must_use]
pub fn parse_command(raw: &str) -> Option<QueryCommand> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "malformed query command JSON");
            return None;
        }
    };
    let Some(action) = value.get("action").and_then(Value::as_str) else {
        warn!("query command without an action field");
        return None;
    };
    match action {
        "init" => Some(QueryCommand::Init),
        "refine" => parse_nodes(&value).map(QueryCommand::Refine),
        "coarsen" => parse_nodes(&value).map(QueryCommand::Coarsen),
        "destroy" => Some(QueryCommand::Destroy),
        other => {
            debug!(action = other, "dropping unknown query action");
            None
        }
    }
}

fn parse_nodes(value: &Value) -> Option<Vec<ObjectId>> {
    let Some(nodes) = value.get("nodes").and_then(Value::as_array) else {
        warn!("refine/coarsen without a nodes array");
        return None;
    };
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let Some(s) = node.as_str() else {
            warn!("non-string entry in nodes array");
            return None;
        };
        match s.parse::<ObjectId>() {
            Ok(id) => out.push(id),
            Err(err) => {
                warn!(%err, node = s, "unparseable node uuid");
                return None;
            }
        }
    }
    Some(out)
}
