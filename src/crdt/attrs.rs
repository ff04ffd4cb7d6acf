//! Per-node attribute map with Last-Writer-Wins conflict resolution (§3.2).
//!
//! Array-valued attributes (`matrix`, `size`, `polygon`) are stored
//! atomically as whole JSON values, never as per-element CRDT sequences,
//! because a partial merge of a transform matrix or polygon is nonsensical.
//! Concurrent sets to the same key are resolved by comparing `(lamport,
//! peer)`, matching the document's causal clock rather than wall time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PeerId;

/// One write to a single attribute key: the value plus enough of its
/// provenance to resolve concurrent writes deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrEntry {
    pub value: Value,
    pub lamport: u64,
    pub peer: PeerId,
}

impl AttrEntry {
    /// Whether `self` should win over `other` when both target the same key.
    /// Higher lamport wins; ties broken by peer id for determinism.
    fn wins_over(&self, other: &AttrEntry) -> bool {
        (self.lamport, self.peer) >= (other.lamport, other.peer)
    }
}

/// The LWW attribute map for one CRDT tree node. Deletions are tombstoned
/// the same way as values so a late-arriving stale `set` cannot resurrect a
/// key that was deleted more recently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrMap {
    entries: HashMap<String, AttrEntry>,
    tombstones: HashMap<String, AttrEntry>,
}

impl AttrMap {
    pub fn new() -> Self {
        AttrMap::default()
    }

    /// Apply a `set key = value` write, accepting it only if it wins over
    /// whatever is currently recorded (live value or tombstone) for `key`.
    /// Returns whether the write took effect.
    pub fn set(&mut self, key: String, value: Value, lamport: u64, peer: PeerId) -> bool {
        let incoming = AttrEntry { value, lamport, peer };
        let current = self.entries.get(&key).or_else(|| self.tombstones.get(&key));
        let accept = match current {
            Some(existing) => incoming.wins_over(existing),
            None => true,
        };
        if accept {
            self.tombstones.remove(&key);
            self.entries.insert(key, incoming);
        }
        accept
    }

    /// Apply a `delete key` write under the same LWW rule as `set`.
    pub fn delete(&mut self, key: &str, lamport: u64, peer: PeerId) -> bool {
        let incoming = AttrEntry { value: Value::Null, lamport, peer };
        let current = self.entries.get(key).or_else(|| self.tombstones.get(key));
        let accept = match current {
            Some(existing) => incoming.wins_over(existing),
            None => true,
        };
        if accept {
            self.entries.remove(key);
            self.tombstones.insert(key.to_string(), incoming);
        }
        accept
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// A flat snapshot of the live attributes, for serializing a node back
    /// out to CSG-tree form.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.entries.iter().map(|(k, e)| (k.clone(), e.value.clone())).collect()
    }

    /// Merge another replica's view of this node's attributes into `self`,
    /// keeping the winner of each key under the LWW rule.
    pub fn merge(&mut self, other: &AttrMap) {
        for (key, entry) in &other.entries {
            self.set(key.clone(), entry.value.clone(), entry.lamport, entry.peer);
        }
        for (key, entry) in &other.tombstones {
            self.delete(key, entry.lamport, entry.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_lamport_wins() {
        let mut attrs = AttrMap::new();
        attrs.set("size".into(), serde_json::json!(1.0), 1, 10);
        assert!(attrs.set("size".into(), serde_json::json!(2.0), 5, 20));
        assert_eq!(attrs.get("size"), Some(&serde_json::json!(2.0)));
        assert!(!attrs.set("size".into(), serde_json::json!(3.0), 3, 99));
        assert_eq!(attrs.get("size"), Some(&serde_json::json!(2.0)));
    }

    #[test]
    fn ties_broken_by_peer_id() {
        let mut attrs = AttrMap::new();
        attrs.set("x".into(), serde_json::json!(1), 4, 1);
        assert!(attrs.set("x".into(), serde_json::json!(2), 4, 2));
        assert_eq!(attrs.get("x"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn delete_tombstones_and_blocks_stale_set() {
        let mut attrs = AttrMap::new();
        attrs.set("x".into(), serde_json::json!(1), 1, 1);
        assert!(attrs.delete("x", 5, 1));
        assert!(attrs.get("x").is_none());
        assert!(!attrs.set("x".into(), serde_json::json!(9), 2, 1));
        assert!(attrs.get("x").is_none());
    }

    #[test]
    fn merge_converges_regardless_of_order() {
        let mut a = AttrMap::new();
        a.set("x".into(), serde_json::json!(1), 1, 1);
        a.set("y".into(), serde_json::json!("keep"), 1, 1);

        let mut b = AttrMap::new();
        b.set("x".into(), serde_json::json!(2), 2, 1);
        b.delete("y", 3, 1);

        let mut merged_ab = a.clone();
        merged_ab.merge(&b);
        let mut merged_ba = b.clone();
        merged_ba.merge(&a);

        assert_eq!(merged_ab.get("x"), merged_ba.get("x"));
        assert_eq!(merged_ab.get("y"), merged_ba.get("y"));
        assert_eq!(merged_ab.get("x"), Some(&serde_json::json!(2)));
        assert!(merged_ab.get("y").is_none());
    }
}
