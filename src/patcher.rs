//! Minimal-diff tree patcher (§4.3).
//!
//! Turns a whole-tree edit (`old` -> `new`, produced by the drawing tool)
//! into the minimum set of CRDT operations needed to carry `old`'s live
//! replica to `new`'s shape: attribute sets/deletes, child create/recurse/
//! delete by id, and sibling moves to realign order. This is what lets two
//! peers edit different parts of the same subtree without clobbering each
//! other, unlike a whole-subtree replace.

use serde_json::{Map, Value};

use crate::crdt::tree::TreeCrdt;
use crate::csg::Node;
use crate::error::StudioResult;
use crate::types::{NodeId, PeerId};

/// One CRDT-level operation emitted by the patcher. [`crate::crdt::tree`] and
/// [`crate::crdt::attrs`] know how to apply each of these to a live document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PatchOp {
    /// Set an atomic attribute (including `type` and `matrix`) on a node.
    SetAttr { node: NodeId, key: String, value: Value },
    /// Delete an attribute present in the old form but absent from the new.
    DeleteAttr { node: NodeId, key: String },
    /// Create a new child under `parent` at `index`, with its own attributes
    /// (but not its own children — those are separate `CreateChild`/`SetAttr`
    /// ops emitted by the recursive call).
    CreateChild { parent: NodeId, child: NodeId, index: usize },
    /// Delete a child subtree entirely (node id no longer present in `new`).
    DeleteChild { parent: NodeId, child: NodeId },
    /// Move a child to a new index among its siblings, preserving identity.
    MoveChild { parent: NodeId, child: NodeId, index: usize },
}

/// Attributes of a node as a flat key/value map, excluding `children` (which
/// is never stored as an attribute per §4.3) and `id` (identity, not state).
fn attrs_of(node: &Node) -> Map<String, Value> {
    let value = serde_json::to_value(node).expect("Node always serializes");
    let mut map = match value {
        Value::Object(map) => map,
        _ => unreachable!("Node serializes to a JSON object"),
    };
    map.remove("id");
    map.remove("children");
    map
}

/// Diff `old` against `new`, both rooted at the same node id, producing the
/// ops needed to carry a live replica of `old` to `new`'s shape.
pub fn diff(old: &Node, new: &Node) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(old, new, &mut ops);
    ops
}

fn diff_into(old: &Node, new: &Node, ops: &mut Vec<PatchOp>) {
    debug_assert_eq!(old.id, new.id);

    if discriminant(old) != discriminant(new) {
        // Full rewrite: clear every old attribute, delete every old child,
        // then set every new attribute and recursively create every new
        // child from scratch.
        for key in attrs_of(old).keys() {
            ops.push(PatchOp::DeleteAttr { node: old.id.clone(), key: key.clone() });
        }
        for child in old.children() {
            ops.push(PatchOp::DeleteChild { parent: old.id.clone(), child: child.id.clone() });
        }
        for (key, value) in attrs_of(new) {
            ops.push(PatchOp::SetAttr { node: new.id.clone(), key, value });
        }
        for (index, child) in new.children().iter().enumerate() {
            create_subtree(&new.id, child, index, ops);
        }
        return;
    }

    diff_attrs(old, new, ops);
    diff_children(old, new, ops);
}

fn diff_attrs(old: &Node, new: &Node, ops: &mut Vec<PatchOp>) {
    let old_attrs = attrs_of(old);
    let new_attrs = attrs_of(new);

    for (key, new_value) in &new_attrs {
        match old_attrs.get(key) {
            Some(old_value) if old_value == new_value => {}
            _ => ops.push(PatchOp::SetAttr {
                node: new.id.clone(),
                key: key.clone(),
                value: new_value.clone(),
            }),
        }
    }
    for key in old_attrs.keys() {
        if !new_attrs.contains_key(key) {
            ops.push(PatchOp::DeleteAttr { node: old.id.clone(), key: key.clone() });
        }
    }
}

fn diff_children(old: &Node, new: &Node, ops: &mut Vec<PatchOp>) {
    let old_children = old.children();
    let new_children = new.children();

    // Matched/created/recursed, in new order.
    for (index, new_child) in new_children.iter().enumerate() {
        match old_children.iter().find(|c| c.id == new_child.id) {
            Some(old_child) => diff_into(old_child, new_child, ops),
            None => create_subtree(&new.id, new_child, index, ops),
        }
    }
    // Deleted: present in old, absent from new.
    for old_child in old_children {
        if !new_children.iter().any(|c| c.id == old_child.id) {
            ops.push(PatchOp::DeleteChild { parent: old.id.clone(), child: old_child.id.clone() });
        }
    }

    realign_order(old_children, new_children, &new.id, ops);
}

/// After structural changes are accounted for, emit sibling moves so that
/// the surviving children end up in `new`'s order. A move preserves
/// identity, which is what makes it safe under concurrent edits elsewhere
/// in the same child list (§4.3).
fn realign_order(old_children: &[Node], new_children: &[Node], parent: &NodeId, ops: &mut Vec<PatchOp>) {
    let old_order: Vec<&NodeId> = old_children
        .iter()
        .map(|c| &c.id)
        .filter(|id| new_children.iter().any(|n| &&n.id == id))
        .collect();
    let new_order: Vec<&NodeId> = new_children.iter().map(|c| &c.id).collect();

    // Simulate the current order, issuing a move whenever the next expected
    // id isn't already in place; this yields O(moved) ops rather than
    // O(n) for lists that only had one element reordered.
    let mut simulated = old_order.clone();
    for (index, wanted) in new_order.iter().enumerate() {
        if simulated.get(index) == Some(wanted) {
            continue;
        }
        if let Some(pos) = simulated.iter().position(|id| id == wanted) {
            simulated.remove(pos);
        }
        simulated.insert(index, wanted);
        ops.push(PatchOp::MoveChild { parent: parent.clone(), child: (*wanted).clone(), index });
    }
}

fn create_subtree(parent: &NodeId, node: &Node, index: usize, ops: &mut Vec<PatchOp>) {
    ops.push(PatchOp::CreateChild { parent: parent.clone(), child: node.id.clone(), index });
    for (key, value) in attrs_of(node) {
        ops.push(PatchOp::SetAttr { node: node.id.clone(), key, value });
    }
    for (child_index, child) in node.children().iter().enumerate() {
        create_subtree(&node.id, child, child_index, ops);
    }
}

/// Apply a sequence of patch ops (as produced by [`diff`] or decoded off the
/// wire) to a live `TreeCrdt`, stamping each attribute write with `lamport`
/// and `peer` for LWW resolution.
pub fn apply_ops(tree: &mut TreeCrdt, ops: &[PatchOp], lamport: u64, peer: PeerId) -> StudioResult<()> {
    for op in ops {
        match op {
            PatchOp::SetAttr { node, key, value } => {
                tree.attrs_mut(node).set(key.clone(), value.clone(), lamport, peer);
            }
            PatchOp::DeleteAttr { node, key } => {
                tree.attrs_mut(node).delete(key, lamport, peer);
            }
            PatchOp::CreateChild { parent, child, index } => {
                tree.insert_child(parent, child.clone(), *index)?;
            }
            PatchOp::DeleteChild { child, .. } => {
                tree.delete_subtree(child);
            }
            PatchOp::MoveChild { parent, child, index } => {
                tree.move_child(parent, child, *index)?;
            }
        }
    }
    Ok(())
}

fn discriminant(node: &Node) -> &'static str {
    match node.kind {
        crate::csg::NodeKind::Cube { .. } => "cube",
        crate::csg::NodeKind::Sphere { .. } => "sphere",
        crate::csg::NodeKind::Cylinder { .. } => "cylinder",
        crate::csg::NodeKind::Extrude { .. } => "extrude",
        crate::csg::NodeKind::Union { .. } => "union",
        crate::csg::NodeKind::Difference { .. } => "difference",
        crate::csg::NodeKind::Intersection { .. } => "intersection",
        crate::csg::NodeKind::Group { .. } => "group",
        crate::csg::NodeKind::Transclude { .. } => "transclude",
    }
}
