// SPDX-License-Identifier: Apache-2.0
//! Location cache for the arbor space server.
//!
//! The cache is the authoritative snapshot of every tracked object's
//! time-stamped position, orientation, bounds, mesh reference, and physics
//! blob. The main loop writes it; the proximity worker reads it through
//! cheap per-id `Arc` snapshots. It also owns the per-(observer, observed,
//! index) location-subscription table that gates outbound location updates
//! until a proximity engine has confirmed the observed object is in the
//! observer's cut.

mod cache;
mod ident;

pub use cache::{LocError, LocListener, LocRecord, LocationCache};
pub use ident::{ClientId, IndexId, ObjectId};
