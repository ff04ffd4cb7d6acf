//! Changes and the lamport clock discipline that orders them (§3.2, Glossary).
//!
//! A change is a contiguous run of operations from one peer. The patcher's
//! per-edit op list becomes exactly one change; `length` is always `1` in
//! this implementation because every edit is committed as a single change
//! rather than batched, which keeps dependency tracking trivial without
//! losing any of the spec's shape (`length` remains in the wire format so a
//! future batching change would be forward-compatible).

use serde::{Deserialize, Serialize};

use crate::patcher::PatchOp;
use crate::types::{Counter, PeerId};

/// A (peer, counter) pointer to a specific change, used for `deps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRef {
    pub peer: PeerId,
    pub counter: Counter,
}

/// One committed change: `{peer, counter, length, lamport, timestamp, deps}`
/// plus the operations it carries (not part of the history wire format, but
/// required to replay/apply the change).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub peer: PeerId,
    pub counter: Counter,
    pub length: u64,
    pub lamport: u64,
    /// Commit-time timestamp, preserved verbatim on replay (§9 Open
    /// Question: not used for ordering — lamport is authoritative).
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub deps: Vec<ChangeRef>,
    pub ops: Vec<PatchOp>,
}

impl Change {
    /// The last counter value covered by this change (`counter + length - 1`).
    pub fn last_counter(&self) -> Counter {
        self.counter + self.length - 1
    }
}

/// A history entry as returned by `GET /rooms/{id}/history` (§6) — the same
/// fields as [`Change`] minus the `ops` payload, which is internal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub peer: PeerId,
    pub counter: Counter,
    pub lamport: u64,
    pub length: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub deps: Vec<ChangeRef>,
}

impl From<&Change> for HistoryEntry {
    fn from(change: &Change) -> Self {
        HistoryEntry {
            peer: change.peer,
            counter: change.counter,
            lamport: change.lamport,
            length: change.length,
            timestamp: change.timestamp,
            deps: change.deps.clone(),
        }
    }
}

/// Lamport clock discipline: `next = max(local, incoming) + 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LamportClock(u64);

impl LamportClock {
    pub fn new() -> Self {
        LamportClock(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Advance for a locally-created change, given the lamport of every
    /// declared dependency.
    pub fn tick_local(&mut self, dep_lamports: impl IntoIterator<Item = u64>) -> u64 {
        let incoming_max = dep_lamports.into_iter().max().unwrap_or(0);
        self.0 = self.0.max(incoming_max) + 1;
        self.0
    }

    /// Observe an incoming remote lamport value without generating one of
    /// our own.
    pub fn observe(&mut self, remote: u64) {
        self.0 = self.0.max(remote);
    }
}
