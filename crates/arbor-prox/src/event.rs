// SPDX-License-Identifier: Apache-2.0

use arbor_loc::{IndexId, ObjectId};
use std::collections::{HashMap, VecDeque};

/// Whether an addition announces a real object or a synthesized aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A leaf world object.
    Object,
    /// An internal aggregate node.
    Aggregate,
}

/// Whether a removal is final or the object may come back (e.g. it moved to
/// the other index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permanence {
    /// The object is gone for good.
    Permanent,
    /// The object left this index but still exists.
    Transient,
}

/// A node entering a query's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addition {
    /// Node identifier (object UUID for leaves, synthesized for aggregates).
    pub id: ObjectId,
    /// Parent node, absent only for the initial announcement of a tree root.
    pub parent: Option<ObjectId>,
    /// Leaf or aggregate.
    pub kind: EntryKind,
}

/// A node leaving a query's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Node identifier.
    pub id: ObjectId,
    /// Final or transient.
    pub permanence: Permanence,
}

/// One batch of cut changes produced by a single engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    /// Index instance the event originated from.
    pub index_id: IndexId,
    /// Nodes entering the view.
    pub additions: Vec<Addition>,
    /// Nodes leaving the view.
    pub removals: Vec<Removal>,
}

impl QueryEvent {
    /// An empty event for `index_id`.
    #[must_use]
    pub fn new(index_id: IndexId) -> Self {
        QueryEvent {
            index_id,
            additions: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Total entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }

    /// Whether the event carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Whether this is the initial announcement of a tree root: a single
    /// parentless addition and nothing else.
    #[must_use]
    pub fn is_root_announcement(&self) -> bool {
        self.removals.is_empty()
            && self.additions.len() == 1
            && self.additions[0].parent.is_none()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(Addition),
    Remove(Removal),
}

impl Op {
    fn id(&self) -> ObjectId {
        match self {
            Op::Add(a) => a.id,
            Op::Remove(r) => r.id,
        }
    }

    fn is_add(&self) -> bool {
        matches!(self, Op::Add(_))
    }
}

/// Coalesces a query's pending events.
///
/// Any `(add x) … (remove x)` or `(remove x) … (add x)` pair cancels,
/// keeping no trace of the intermediate state. Survivors are rechunked into
/// events of at most `max_per_event` entries, except that a parentless root
/// addition always stands alone so its index-properties payload cannot be
/// split away from it.
///
/// The net membership delta of the output equals that of the input.
#[must_use]
pub fn coalesce(events: VecDeque<QueryEvent>, max_per_event: usize) -> VecDeque<QueryEvent> {
    let Some(index_id) = events.front().map(|e| e.index_id) else {
        return VecDeque::new();
    };
    let max_per_event = max_per_event.max(1);

    // Flatten to a single op stream, removals before additions within one
    // event (an event never holds both kinds for the same id).
    let mut ops: Vec<Option<Op>> = Vec::new();
    let mut last_live: HashMap<ObjectId, (usize, bool)> = HashMap::new();
    for event in events {
        let flat = event
            .removals
            .into_iter()
            .map(Op::Remove)
            .chain(event.additions.into_iter().map(Op::Add));
        for op in flat {
            if let Some(&(pos, was_add)) = last_live.get(&op.id()) {
                if was_add != op.is_add() {
                    ops[pos] = None;
                    last_live.remove(&op.id());
                    continue;
                }
            }
            last_live.insert(op.id(), (ops.len(), op.is_add()));
            ops.push(Some(op));
        }
    }

    let mut out: VecDeque<QueryEvent> = VecDeque::new();
    let mut current = QueryEvent::new(index_id);
    for op in ops.into_iter().flatten() {
        let lone = matches!(&op, Op::Add(a) if a.parent.is_none());
        if lone && !current.is_empty() {
            out.push_back(std::mem::replace(&mut current, QueryEvent::new(index_id)));
        }
        match op {
            Op::Add(a) => current.additions.push(a),
            Op::Remove(r) => current.removals.push(r),
        }
        if lone || current.len() >= max_per_event {
            out.push_back(std::mem::replace(&mut current, QueryEvent::new(index_id)));
        }
    }
    if !current.is_empty() {
        out.push_back(current);
    }
    out
}
