// SPDX-License-Identifier: Apache-2.0

use crate::cut::Cut;
use crate::event::QueryEvent;
use arbor_geom::{BoundingSphere, TimedMotion};
use arbor_loc::ClientId;
use std::collections::VecDeque;
use std::fmt;

/// Handle for a registered query, unique within one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", self.0)
    }
}

/// Registration parameters. Manual queries drive their own resolution via
/// refine/coarsen, so these are placeholders carried for wire parity.
#[derive(Debug, Clone, Copy)]
pub struct QueryParams {
    /// Querier position.
    pub position: TimedMotion,
    /// Querier bounds.
    pub bounds: BoundingSphere,
    /// Maximum result count hint; zero means unbounded.
    pub max_results: u32,
}

impl QueryParams {
    /// The placeholder registration used by `init`.
    #[must_use]
    pub fn placeholder(t: arbor_geom::SimTime) -> Self {
        QueryParams {
            position: TimedMotion::stationary(t, glam::Vec3::ZERO),
            bounds: BoundingSphere::zero(),
            max_results: 0,
        }
    }
}

/// Per-query state owned by a handler.
pub(crate) struct Query {
    pub params: QueryParams,
    pub cut: Cut,
    pub events: VecDeque<QueryEvent>,
    /// Destination client; events are only drained once a listener is
    /// attached, so `init` can finish setup before anything fires.
    pub listener: Option<ClientId>,
}

impl Query {
    pub fn new(params: QueryParams) -> Self {
        Query {
            params,
            cut: Cut::default(),
            events: VecDeque::new(),
            listener: None,
        }
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Drains pending events into `out`, preserving order.
    pub fn pop_events(&mut self, out: &mut VecDeque<QueryEvent>) {
        out.append(&mut self.events);
    }
}
