//! The top-level CRDT document: tree state, causal clock, and the change
//! log the merge-point engine and wire protocol operate over (§3.2).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crdt::change::{Change, ChangeRef, HistoryEntry, LamportClock};
use crate::crdt::tree::TreeCrdt;
use crate::error::{StudioError, StudioResult};
use crate::patcher::{self, PatchOp};
use crate::types::{vector_clock_covers, Counter, Frontier, PeerId, VectorClock};

/// The parts of a document that survive compaction: tree content, the
/// causal clock, and each peer's current frontier entry. Everything else
/// (the change log) is uncompacted WAL state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentSnapshot {
    tree: TreeCrdt,
    lamport: u64,
    frontier: HashMap<PeerId, ChangeRef>,
}

/// A CRDT document: one per room replica (service-side) or one per client.
#[derive(Debug, Clone, Default)]
pub struct Document {
    tree: TreeCrdt,
    lamport: LamportClock,
    /// Each peer's most recent committed change, i.e. the document's
    /// frontier (Glossary: "a cut in the causal DAG").
    frontier: HashMap<PeerId, ChangeRef>,
    /// Changes since the last compaction/snapshot import, kept for history
    /// queries, forking, and the merge-point engine.
    changes: Vec<Change>,
}

/// Every document's tree is rooted at this fixed id (§3.2: "Each document is
/// a tree CRDT whose single root is a group").
pub const ROOT_ID: &str = "root";

impl Document {
    /// A fresh document: an empty `group` at [`ROOT_ID`]. This bootstrap is
    /// not itself a tracked change — it predates any peer's clock — so it
    /// never appears in `history()` or a delta, and every replica created
    /// this way already agrees on it without needing to exchange it.
    pub fn new() -> Self {
        let mut tree = TreeCrdt::new();
        tree.set_root(ROOT_ID.into());
        tree.attrs_mut(&ROOT_ID.to_string()).set("type".into(), serde_json::json!("group"), 0, 0);
        Document { tree, ..Document::default() }
    }

    pub fn tree(&self) -> &TreeCrdt {
        &self.tree
    }

    /// The document's version vector: for each peer, the next counter not
    /// yet seen (§3.2).
    pub fn version_vector(&self) -> VectorClock {
        self.frontier.iter().map(|(peer, r)| (*peer, r.counter + 1)).collect()
    }

    /// The document's frontier as a sorted `Frontier` value, suitable for
    /// the `snapshot?at=` query string or an S_CATCHUP reply.
    pub fn frontier(&self) -> Frontier {
        Frontier::new(self.frontier.values().map(|r| (r.peer, r.counter)).collect())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> = self.changes.iter().map(HistoryEntry::from).collect();
        entries.sort_by_key(|e| e.lamport);
        entries
    }

    /// Commit a locally-produced set of patch ops as a new change from
    /// `peer`, applying them to the tree and returning the encoded update
    /// bytes ready to send as C_UPDATE / broadcast as S_UPDATE.
    pub fn commit_local(
        &mut self,
        peer: PeerId,
        ops: Vec<PatchOp>,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> StudioResult<Vec<u8>> {
        let counter = self.frontier.get(&peer).map(|r| r.counter + 1).unwrap_or(0);
        let deps: Vec<ChangeRef> = self.frontier.values().copied().collect();
        let dep_lamports = deps.iter().filter_map(|d| self.lamport_of(d));
        let lamport = self.lamport.tick_local(dep_lamports.collect::<Vec<_>>());

        patcher::apply_ops(&mut self.tree, &ops, lamport, peer)?;

        let change = Change { peer, counter, length: 1, lamport, timestamp, deps, ops };
        self.record(change.clone());
        encode_update(&change)
    }

    /// Apply a remote update received as C_UPDATE/S_UPDATE payload.
    /// Idempotent: re-applying an already-seen change is a no-op.
    pub fn apply_update(&mut self, bytes: &[u8]) -> StudioResult<()> {
        let change = decode_update(bytes)?;
        if self.has_seen(change.peer, change.last_counter()) {
            return Ok(());
        }
        self.lamport.observe(change.lamport);
        patcher::apply_ops(&mut self.tree, &change.ops, change.lamport, change.peer)?;
        self.record(change);
        Ok(())
    }

    fn has_seen(&self, peer: PeerId, counter: Counter) -> bool {
        self.frontier.get(&peer).map(|r| r.counter >= counter).unwrap_or(false)
    }

    fn lamport_of(&self, r: &ChangeRef) -> Option<u64> {
        self.changes
            .iter()
            .find(|c| c.peer == r.peer && c.counter <= r.counter && c.last_counter() >= r.counter)
            .map(|c| c.lamport)
    }

    fn record(&mut self, change: Change) {
        let last = change.last_counter();
        self.frontier
            .entry(change.peer)
            .and_modify(|r| r.counter = r.counter.max(last))
            .or_insert(ChangeRef { peer: change.peer, counter: last });
        self.changes.push(change);
    }

    /// Compute the delta an S_CATCHUP reply should carry for a peer whose
    /// last-known version vector is `since`: every recorded change not
    /// covered by `since`, encoded as one blob per change.
    pub fn delta_since(&self, since: &VectorClock) -> Vec<Vec<u8>> {
        self.changes
            .iter()
            .filter(|c| since.get(&c.peer).copied().unwrap_or(0) <= c.counter)
            .filter_map(|c| encode_update(c).ok())
            .collect()
    }

    /// Fork the replica at `frontier`: replay only the changes whose
    /// inclusive history is covered by it, into a brand new document.
    /// Limited to changes still held in this replica's uncompacted log —
    /// forking past a compaction boundary is not supported (§D).
    pub fn fork_at(&self, frontier: &Frontier) -> Document {
        let target = frontier.as_vector_clock();
        let mut forked = Document::new();
        let mut ordered = self.changes.clone();
        ordered.sort_by_key(|c| c.lamport);
        for change in ordered {
            let mut point = VectorClock::new();
            point.insert(change.peer, change.last_counter());
            if vector_clock_covers(&target, &point) {
                let _ = patcher::apply_ops(&mut forked.tree, &change.ops, change.lamport, change.peer);
                forked.lamport.observe(change.lamport);
                forked.record(change);
            }
        }
        forked
    }

    /// Export a compacted snapshot (tree + causal clock), clearing the
    /// uncompacted change log (§4.4 "Compaction").
    pub fn compact(&mut self) -> StudioResult<Vec<u8>> {
        let bytes = self.export_snapshot()?;
        self.changes.clear();
        Ok(bytes)
    }

    pub fn export_snapshot(&self) -> StudioResult<Vec<u8>> {
        let snapshot =
            DocumentSnapshot { tree: self.tree.clone(), lamport: self.lamport.value(), frontier: self.frontier.clone() };
        bincode::serialize(&snapshot).map_err(StudioError::Encoding)
    }

    pub fn import_snapshot(bytes: &[u8]) -> StudioResult<Document> {
        let snapshot: DocumentSnapshot = bincode::deserialize(bytes).map_err(StudioError::Encoding)?;
        let mut lamport = LamportClock::new();
        lamport.observe(snapshot.lamport);
        Ok(Document { tree: snapshot.tree, lamport, frontier: snapshot.frontier, changes: Vec::new() })
    }
}

pub fn encode_update(change: &Change) -> StudioResult<Vec<u8>> {
    bincode::serialize(change).map_err(StudioError::Encoding)
}

pub fn decode_update(bytes: &[u8]) -> StudioResult<Change> {
    bincode::deserialize(bytes).map_err(StudioError::Encoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csg::{Node, NodeKind, SizeSpec};

    fn cube(id: &str) -> Node {
        Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
    }

    fn insert_root_ops(id: &str) -> Vec<PatchOp> {
        vec![PatchOp::SetAttr { node: id.into(), key: "type".into(), value: serde_json::json!("group") }]
    }

    #[test]
    fn two_peers_concurrent_inserts_converge() {
        let mut doc_x = Document::new();
        let mut doc_y = Document::new();
        doc_x.tree.set_root("root".into());
        doc_y.tree.set_root("root".into());

        let ops_x = patcher::diff(&Node::new("root", NodeKind::Group { children: vec![] }), &Node::new("root", NodeKind::Group { children: vec![cube("u1")] }));
        let ops_y = patcher::diff(&Node::new("root", NodeKind::Group { children: vec![] }), &Node::new("root", NodeKind::Group { children: vec![cube("u2")] }));

        let update_x = doc_x.commit_local(1, ops_x, chrono::Utc::now()).unwrap();
        let update_y = doc_y.commit_local(2, ops_y, chrono::Utc::now()).unwrap();

        doc_x.apply_update(&update_y).unwrap();
        doc_y.apply_update(&update_x).unwrap();

        let root_id = "root".to_string();
        let mut x_children: Vec<String> =
            doc_x.tree.children_of(&root_id).to_vec();
        let mut y_children: Vec<String> =
            doc_y.tree.children_of(&root_id).to_vec();
        x_children.sort();
        y_children.sort();
        assert_eq!(x_children, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(x_children, y_children);
    }

    #[test]
    fn apply_update_is_idempotent() {
        let mut doc = Document::new();
        doc.tree.set_root("root".into());
        let update = doc.commit_local(1, insert_root_ops("root"), chrono::Utc::now()).unwrap();
        let before = doc.history().len();
        doc.apply_update(&update).unwrap();
        assert_eq!(doc.history().len(), before);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut doc = Document::new();
        doc.tree.set_root("root".into());
        doc.commit_local(1, insert_root_ops("root"), chrono::Utc::now()).unwrap();
        let bytes = doc.export_snapshot().unwrap();
        let restored = Document::import_snapshot(&bytes).unwrap();
        assert_eq!(restored.version_vector(), doc.version_vector());
        assert_eq!(restored.tree().children_of(&"root".to_string()), doc.tree().children_of(&"root".to_string()));
    }

    #[test]
    fn compaction_clears_the_change_log_but_keeps_state() {
        let mut doc = Document::new();
        doc.tree.set_root("root".into());
        doc.commit_local(1, insert_root_ops("root"), chrono::Utc::now()).unwrap();
        assert!(!doc.history().is_empty());
        doc.compact().unwrap();
        assert!(doc.history().is_empty());
        assert_eq!(doc.version_vector().get(&1), Some(&1));
    }
}
