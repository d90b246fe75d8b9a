// SPDX-License-Identifier: Apache-2.0
//! Proximity session wire schema for the arbor space server.
//!
//! Clients drive their queries with [`QueryRequest`] command frames whose
//! `query_parameters` field holds a JSON object (`action` plus
//! action-specific fields); the server answers with [`ProximityResults`]
//! frames carrying sequence-numbered additions and removals. Both
//! directions use the same length-prefixed packet layout (see [`wire`]).

use arbor_geom::{AggregateBounds, TimedMotion, TimedRotation};
use arbor_loc::ObjectId;
use serde::{Deserialize, Serialize};

/// JSON command parsing for `query_parameters`.
pub mod command;
/// Deterministic packet framing and CBOR helpers.
pub mod wire;

/// A client command frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    /// JSON object with an `action` field plus action-specific fields.
    pub query_parameters: String,
}

/// Static/dynamic classification of an index, carried on the first
/// announcement of its tree root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DynamicClassification {
    /// The index holds slow or stationary objects.
    Static,
    /// The index holds moving objects.
    Dynamic,
}

/// Properties identifying which index an update came from.
///
/// `id` is always present so the client can group updates per tree; the
/// origin identifier and classification ride only on the initial root
/// announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexProperties {
    /// Tree-local numeric identifier.
    pub id: u32,
    /// Origin-server identifier.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index_id: Option<String>,
    /// Static or dynamic index.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dynamic_classification: Option<DynamicClassification>,
}

/// Whether an addition is a world object or a synthesized aggregate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AdditionType {
    /// A leaf world object.
    Object,
    /// An internal aggregate.
    Aggregate,
}

/// Whether a removal is final or the object may reappear elsewhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemovalType {
    /// Gone for good.
    Permanent,
    /// Left this index only.
    Transient,
}

/// A node entering the client's view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectAddition {
    /// Node identifier.
    pub object: ObjectId,
    /// Parent node; absent only on the initial root announcement.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ObjectId>,
    /// Per-client sequence number.
    pub seqno: u64,
    /// Time-stamped position and velocity.
    pub location: TimedMotion,
    /// Time-stamped orientation and angular velocity.
    pub orientation: TimedRotation,
    /// Aggregate bounding info.
    pub aggregate_bounds: AggregateBounds,
    /// Mesh reference, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mesh: Option<String>,
    /// Physics blob, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub physics: Option<String>,
    /// Object or aggregate.
    #[serde(rename = "type")]
    pub kind: AdditionType,
}

/// A node leaving the client's view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRemoval {
    /// Node identifier.
    pub object: ObjectId,
    /// Per-client sequence number.
    pub seqno: u64,
    /// Permanent or transient.
    #[serde(rename = "type")]
    pub kind: RemovalType,
}

/// One update within a results frame: the contents of a single query event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProximityUpdate {
    /// Index identification, full only on root announcements.
    pub index_properties: IndexProperties,
    /// Nodes entering the view.
    pub additions: Vec<ObjectAddition>,
    /// Nodes leaving the view.
    pub removals: Vec<ObjectRemoval>,
}

/// A results frame shipped to one client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProximityResults {
    /// Server simulation time, microseconds.
    pub t: u64,
    /// Updates in emission order.
    pub updates: Vec<ProximityUpdate>,
}

/// Wire envelope for the proximity substream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Client command frame.
    QueryRequest(QueryRequest),
    /// Server results frame.
    Results(ProximityResults),
}
