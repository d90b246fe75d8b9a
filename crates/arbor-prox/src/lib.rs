// SPDX-License-Identifier: Apache-2.0
//! arbor-prox: the manual proximity query engine.
//!
//! Clients (object hosts) register queries against hierarchical spatial
//! indexes and hold an incrementally refinable view — a *cut* — over each
//! index's bounding-volume tree. The engine keeps cuts consistent while
//! objects churn, splits slow from fast objects into separate static and
//! dynamic indexes with dwell-time hysteresis, and produces per-query
//! add/remove event streams that the server frames and ships.
//!
//! Everything in this crate runs on the proximity worker thread; the only
//! shared state it touches is the read side of the
//! [`arbor_loc::LocationCache`].

mod aggregate;
mod classifier;
mod config;
mod cut;
mod engine;
mod event;
mod handler;
mod query;
mod tree;

pub use aggregate::{AggregateListener, NullAggregateListener};
pub use classifier::Classifier;
pub use config::{ConfigError, ProxConfig};
pub use engine::{DrainedQuery, ObjectClass, ProxEngine};
pub use event::{coalesce, Addition, EntryKind, Permanence, QueryEvent, Removal};
pub use handler::{NodeView, QueryHandler};
pub use query::{QueryId, QueryParams};
