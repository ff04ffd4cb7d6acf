//! Core identifiers and small value types shared across the crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a CSG node (128-bit UUID form, §3.1).
pub type NodeId = String;

/// Identifier for a room, matching the grammar `[A-Za-z0-9_:.\-]+` (§6, §9).
pub type RoomId = String;

/// Stable per-connection peer identifier assigned by the room service (§3.2).
pub type PeerId = u64;

/// Monotonically increasing per-peer operation counter.
pub type Counter = u64;

/// A version vector: for each peer, the next counter value not yet seen.
pub type VectorClock = HashMap<PeerId, Counter>;

/// A cut in the causal DAG: the set of (peer, counter) pairs identifying a
/// document state (§3.2, glossary "Frontier").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontier(pub Vec<(PeerId, Counter)>);

impl Frontier {
    pub fn new(mut points: Vec<(PeerId, Counter)>) -> Self {
        points.sort_unstable();
        Frontier(points)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the `at=p1:c1,p2:c2,...` query parameter from §6.
    pub fn parse(raw: &str) -> Result<Self, crate::error::StudioError> {
        if raw.trim().is_empty() {
            return Ok(Frontier::default());
        }
        let mut points = Vec::new();
        for part in raw.split(',') {
            let (peer_str, counter_str) = part.split_once(':').ok_or_else(|| {
                crate::error::StudioError::MalformedFrontier(format!(
                    "expected peer:counter, got {part:?}"
                ))
            })?;
            let peer: PeerId = peer_str.parse().map_err(|_| {
                crate::error::StudioError::MalformedFrontier(format!(
                    "invalid peer id {peer_str:?}"
                ))
            })?;
            let counter: Counter = counter_str.parse().map_err(|_| {
                crate::error::StudioError::MalformedFrontier(format!(
                    "invalid counter {counter_str:?}"
                ))
            })?;
            points.push((peer, counter));
        }
        Ok(Frontier::new(points))
    }

    pub fn to_query_string(&self) -> String {
        self.0
            .iter()
            .map(|(peer, counter)| format!("{peer}:{counter}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// As a version-vector-shaped map, for use with [`VectorClock`] helpers.
    pub fn as_vector_clock(&self) -> VectorClock {
        self.0.iter().cloned().collect()
    }
}

/// Pointwise-max two version vectors (used for inclusive-version-vector
/// computation in the merge-point engine, §4.6).
pub fn vector_clock_max(a: &VectorClock, b: &VectorClock) -> VectorClock {
    let mut out = a.clone();
    for (peer, counter) in b {
        let entry = out.entry(*peer).or_insert(0);
        *entry = (*entry).max(*counter);
    }
    out
}

/// Whether `a` covers `b`: every peer in `b` has a counter in `a` that is
/// greater than or equal to it (§4.6 "covers").
pub fn vector_clock_covers(a: &VectorClock, b: &VectorClock) -> bool {
    b.iter().all(|(peer, counter)| a.get(peer).copied().unwrap_or(0) >= *counter)
}

/// Validate a room id against the grammar from §6/§9:
/// `[A-Za-z0-9_:.\-]+`.
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontier_round_trips_through_query_string() {
        let f = Frontier::new(vec![(2, 7), (1, 3)]);
        let s = f.to_query_string();
        let parsed = Frontier::parse(&s).unwrap();
        assert_eq!(f, parsed);
    }

    #[test]
    fn empty_frontier_parses_to_empty() {
        assert_eq!(Frontier::parse("").unwrap(), Frontier::default());
    }

    #[test]
    fn malformed_frontier_is_rejected() {
        assert!(Frontier::parse("not-a-frontier").is_err());
        assert!(Frontier::parse("1:2,bogus").is_err());
    }

    #[test]
    fn room_id_grammar() {
        assert!(is_valid_room_id("room-1"));
        assert!(is_valid_room_id("team:project.floor_3"));
        assert!(!is_valid_room_id(""));
        assert!(!is_valid_room_id("has space"));
        assert!(!is_valid_room_id("has/slash"));
    }

    #[test]
    fn vector_clock_covers_is_pointwise() {
        let mut a = VectorClock::new();
        a.insert(1, 5);
        a.insert(2, 3);
        let mut b = VectorClock::new();
        b.insert(1, 5);
        assert!(vector_clock_covers(&a, &b));
        b.insert(2, 4);
        assert!(!vector_clock_covers(&a, &b));
    }
}
