//! CRDT tree container: parent/child structure plus each node's attribute
//! map, forming the authoritative replica that [`crate::patcher`] ops are
//! applied against (§3.2).
//!
//! Structure (who is whose child, in what order) is tracked separately from
//! attribute values so that a concurrent move and a concurrent attribute
//! edit on the same node always compose rather than racing.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::attrs::AttrMap;
use crate::csg::Node;
use crate::error::{StudioError, StudioResult};
use crate::types::NodeId;

/// The tree-structure + attribute-map CRDT for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeCrdt {
    /// Ordered children of each node. The root has no entry in `parents`.
    children: HashMap<NodeId, Vec<NodeId>>,
    parents: HashMap<NodeId, NodeId>,
    attrs: HashMap<NodeId, AttrMap>,
    tombstones: HashSet<NodeId>,
    root: Option<NodeId>,
}

impl TreeCrdt {
    pub fn new() -> Self {
        TreeCrdt::default()
    }

    pub fn root(&self) -> Option<&NodeId> {
        self.root.as_ref()
    }

    /// Set the tree's root node, creating its (empty) attribute map if
    /// needed. No-op if a root is already set to the same id.
    pub fn set_root(&mut self, id: NodeId) {
        self.attrs.entry(id.clone()).or_default();
        self.root = Some(id);
    }

    /// Insert `child` under `parent` at `index`, clamped to the current
    /// child count. Rejects the insert if it would create a cycle.
    pub fn insert_child(&mut self, parent: &NodeId, child: NodeId, index: usize) -> StudioResult<()> {
        if self.is_descendant(parent, &child) {
            return Err(StudioError::MalformedUpdate(format!(
                "inserting {child} under {parent} would create a cycle"
            )));
        }
        if let Some(old_parent) = self.parents.get(&child).cloned() {
            self.detach(&old_parent, &child);
        }
        let siblings = self.children.entry(parent.clone()).or_default();
        let index = index.min(siblings.len());
        siblings.insert(index, child.clone());
        self.parents.insert(child.clone(), parent.clone());
        self.attrs.entry(child.clone()).or_default();
        self.tombstones.remove(&child);
        Ok(())
    }

    /// Delete `child` and its whole subtree.
    pub fn delete_subtree(&mut self, child: &NodeId) {
        for descendant in self.get_descendants(child) {
            self.remove_node_only(&descendant);
        }
        if let Some(parent) = self.parents.get(child).cloned() {
            self.detach(&parent, child);
        }
        self.remove_node_only(child);
    }

    fn remove_node_only(&mut self, id: &NodeId) {
        self.children.remove(id);
        self.parents.remove(id);
        self.attrs.remove(id);
        self.tombstones.insert(id.clone());
    }

    fn detach(&mut self, parent: &NodeId, child: &NodeId) {
        if let Some(siblings) = self.children.get_mut(parent) {
            siblings.retain(|id| id != child);
        }
    }

    /// Move `child` to `index` among `new_parent`'s children, preserving
    /// identity (so concurrent attribute writes to `child` still land).
    pub fn move_child(&mut self, new_parent: &NodeId, child: &NodeId, index: usize) -> StudioResult<()> {
        if self.is_descendant(new_parent, child) {
            return Err(StudioError::MalformedUpdate(format!(
                "moving {child} under {new_parent} would create a cycle"
            )));
        }
        if let Some(old_parent) = self.parents.get(child).cloned() {
            self.detach(&old_parent, child);
        }
        let siblings = self.children.entry(new_parent.clone()).or_default();
        let index = index.min(siblings.len());
        siblings.insert(index, child.clone());
        self.parents.insert(child.clone(), new_parent.clone());
        Ok(())
    }

    pub fn children_of(&self, parent: &NodeId) -> &[NodeId] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent_of(&self, child: &NodeId) -> Option<&NodeId> {
        self.parents.get(child)
    }

    pub fn attrs(&self, id: &NodeId) -> Option<&AttrMap> {
        self.attrs.get(id)
    }

    pub fn attrs_mut(&mut self, id: &NodeId) -> &mut AttrMap {
        self.attrs.entry(id.clone()).or_default()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.attrs.contains_key(id)
    }

    fn get_descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<NodeId> = self.children_of(id).to_vec().into();
        while let Some(next) = queue.pop_front() {
            for child in self.children_of(&next) {
                queue.push_back(child.clone());
            }
            out.push(next);
        }
        out
    }

    fn is_descendant(&self, candidate: &NodeId, ancestor: &NodeId) -> bool {
        candidate == ancestor || self.get_descendants(ancestor).iter().any(|id| id == candidate)
    }

    /// Merge another replica's tree and attribute state into `self`. Node
    /// creations/moves from `other` are replayed in top-down order so a
    /// child is never reattached before its parent exists; attribute maps
    /// are merged key-by-key under LWW.
    pub fn merge(&mut self, other: &TreeCrdt) {
        if self.root.is_none() {
            self.root = other.root.clone();
        }
        let mut queue: VecDeque<NodeId> = other.root.iter().cloned().collect();
        let mut visited = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(parent) = other.parents.get(&id) {
                if !self.parents.contains_key(&id) {
                    let siblings = other.children_of(parent);
                    let index = siblings.iter().position(|c| c == &id).unwrap_or(0);
                    let _ = self.insert_child(parent, id.clone(), index);
                }
            }
            if let Some(attrs) = other.attrs.get(&id) {
                self.attrs_mut(&id).merge(attrs);
            }
            for child in other.children_of(&id) {
                queue.push_back(child.clone());
            }
        }
        for id in &other.tombstones {
            if !other.attrs.contains_key(id) {
                self.delete_subtree(id);
            }
        }
    }

    /// Reconstruct a [`Node`] tree rooted at `id` from the current
    /// structure and attributes, for export to the patcher or the
    /// evaluator.
    pub fn export(&self, id: &NodeId) -> StudioResult<Node> {
        let attrs = self
            .attrs(id)
            .ok_or_else(|| StudioError::NodeNotFound(id.clone()))?;
        let mut obj = attrs.snapshot();
        obj.insert("id".to_string(), Value::String(id.clone()));
        let children: Result<Vec<Node>, StudioError> =
            self.children_of(id).iter().map(|child| self.export(child)).collect();
        obj.insert("children".to_string(), Value::Array(
            children?.into_iter().map(|n| serde_json::to_value(n).expect("Node serializes")).collect(),
        ));
        serde_json::from_value(Value::Object(obj))
            .map_err(|e| StudioError::MalformedUpdate(format!("node {id} failed to reconstruct: {e}")))
    }

    /// Load a [`Node`] tree into the CRDT structure from scratch (used when
    /// hydrating an empty document, §4.4).
    pub fn import_tree(&mut self, node: &Node, parent: Option<&NodeId>) {
        if let Some(parent) = parent {
            let index = self.children_of(parent).len();
            let _ = self.insert_child(parent, node.id.clone(), index);
        } else {
            self.set_root(node.id.clone());
        }
        let attrs = self.attrs_mut(&node.id);
        let value = serde_json::to_value(node).expect("Node serializes");
        if let Value::Object(map) = value {
            for (key, v) in map {
                if key == "id" || key == "children" {
                    continue;
                }
                attrs.set(key, v, 0, 0);
            }
        }
        for child in node.children() {
            self.import_tree(child, Some(&node.id));
        }
    }
}
