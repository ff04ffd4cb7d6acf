//! The CSG tree data model and pure structural operations over it (§3.1, §4.2).
//!
//! A [`Node`] is the typed tree a user edits with the drawing tool. It has no
//! CRDT machinery of its own — [`crate::patcher`] is what keeps a CRDT
//! document in sync with edits made to a tree of this shape, and
//! [`crate::evaluator`] is what turns a tree of this shape into geometry.

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, RoomId};

/// A 4x4 transform matrix, stored column-major as specified in §3.1.
pub type Matrix4 = [f64; 16];

pub const IDENTITY: Matrix4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Multiply two column-major 4x4 matrices: `a * b`.
pub fn matrix_multiply(a: &Matrix4, b: &Matrix4) -> Matrix4 {
    let mut out = [0.0f64; 16];
    for col in 0..4 {
        for row in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[k * 4 + row] * b[col * 4 + k];
            }
            out[col * 4 + row] = sum;
        }
    }
    out
}

/// `cube.size` may be a single scalar (cubic) or a `[x, y, z]` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Uniform(f64),
    Triple([f64; 3]),
}

/// A 2D point used by `extrude.polygon`.
pub type Point2 = [f64; 2];

/// A (peer, counter) pair, used by `transclude.frontiers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub peer: u64,
    pub counter: u64,
}

/// The closed set of CSG node variants (§3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Cube {
        size: SizeSpec,
        center: bool,
    },
    Sphere {
        radius: f64,
        segments: u32,
    },
    Cylinder {
        #[serde(skip_serializing_if = "Option::is_none")]
        radius: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        radius_low: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        radius_high: Option<f64>,
        height: f64,
        segments: u32,
        center: bool,
    },
    Extrude {
        polygon: Vec<Point2>,
        height: f64,
    },
    Union {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        children: Vec<Node>,
    },
    Difference {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        children: Vec<Node>,
    },
    Intersection {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        children: Vec<Node>,
    },
    Group {
        children: Vec<Node>,
    },
    Transclude {
        room_id: RoomId,
        #[serde(skip_serializing_if = "Option::is_none")]
        frontiers: Option<Vec<FrontierPoint>>,
    },
}

/// One node in a CSG tree: a globally-unique id, a variant, and an optional
/// local transform (§3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix4>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Node { id: id.into(), kind, matrix: None }
    }

    pub fn with_matrix(mut self, matrix: Matrix4) -> Self {
        self.matrix = Some(matrix);
        self
    }

    /// `hasChildren(node) -> bool` (§4.2).
    pub fn has_children(&self) -> bool {
        !self.children().is_empty()
    }

    /// Borrowed view of this node's ordered children, or an empty slice for
    /// leaf/transclude nodes (a `transclude`'s children are synthesised only
    /// at resolve time, §3.1).
    pub fn children(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Union { children, .. }
            | NodeKind::Difference { children, .. }
            | NodeKind::Intersection { children, .. }
            | NodeKind::Group { children } => children,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match &mut self.kind {
            NodeKind::Union { children, .. }
            | NodeKind::Difference { children, .. }
            | NodeKind::Intersection { children, .. }
            | NodeKind::Group { children } => Some(children),
            _ => None,
        }
    }
}

/// Mint a fresh node id: "a globally-unique string `id` (128-bit UUID
/// form)" (§3.1), as the drawing tool does whenever a user creates a node.
pub fn new_node_id() -> NodeId {
    uuid::Uuid::new_v4().to_string()
}

/// `findNodeById(root, id) -> node?` (§4.2).
pub fn find_node_by_id<'a>(root: &'a Node, id: &str) -> Option<&'a Node> {
    if root.id == id {
        return Some(root);
    }
    root.children().iter().find_map(|child| find_node_by_id(child, id))
}

/// `findParent(root, id) -> node?` (§4.2).
pub fn find_parent<'a>(root: &'a Node, id: &str) -> Option<&'a Node> {
    if root.children().iter().any(|child| child.id == id) {
        return Some(root);
    }
    root.children().iter().find_map(|child| find_parent(child, id))
}

/// `findDirectChildAncestor(root, leafId, parentId) -> id?` (§4.2).
///
/// Walks up from `leafId` until the direct child of `parentId` is found;
/// used to map a face click at a given cursor level to the selectable node.
pub fn find_direct_child_ancestor(root: &Node, leaf_id: &str, parent_id: &str) -> Option<NodeId> {
    let path = path_to(root, leaf_id)?;
    let parent_index = path.iter().position(|n| n.id == parent_id)?;
    path.get(parent_index + 1).map(|n| n.id.clone())
}

/// Root-to-target path of node references, inclusive of both ends.
fn path_to<'a>(root: &'a Node, id: &str) -> Option<Vec<&'a Node>> {
    if root.id == id {
        return Some(vec![root]);
    }
    for child in root.children() {
        if let Some(mut sub) = path_to(child, id) {
            sub.insert(0, root);
            return Some(sub);
        }
    }
    None
}

/// `replaceNode(root, id, newNode) -> newRoot` (§4.2).
///
/// Copy-on-write path replacement: only the spine from the root to `id` is
/// cloned, every untouched sibling subtree is shared structurally by value
/// (CSG trees here are owned, so "shared" means an unmodified clone, but the
/// recursion only touches nodes on the path).
pub fn replace_node(root: &Node, id: &str, new_node: Node) -> Node {
    if root.id == id {
        return new_node;
    }
    let mut next = root.clone();
    if let Some(children) = next.children_mut() {
        for child in children.iter_mut() {
            if find_node_by_id(child, id).is_some() {
                *child = replace_node(child, id, new_node);
                break;
            }
        }
    }
    next
}

/// `getAncestorTransforms(root, id) -> list<matrix> | nil` (§4.2).
///
/// Ordered root-to-target, one entry per ancestor (including the target
/// itself) that carries a matrix; ancestors with no matrix are skipped.
pub fn get_ancestor_transforms(root: &Node, id: &str) -> Option<Vec<Matrix4>> {
    let path = path_to(root, id)?;
    Some(path.iter().filter_map(|n| n.matrix).collect())
}

/// `applyTransformDelta(root, id, delta) -> newRoot` (§4.2).
///
/// Left-multiplies the target node's matrix by `delta`, creating an
/// identity-based matrix first if the node doesn't have one.
pub fn apply_transform_delta(root: &Node, id: &str, delta: &Matrix4) -> Option<Node> {
    let target = find_node_by_id(root, id)?;
    let base = target.matrix.unwrap_or(IDENTITY);
    let mut updated = target.clone();
    updated.matrix = Some(matrix_multiply(delta, &base));
    Some(replace_node(root, id, updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(id: &str) -> Node {
        Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
    }

    fn union(id: &str, children: Vec<Node>) -> Node {
        Node::new(id, NodeKind::Union { name: None, children })
    }

    #[test]
    fn new_node_id_is_a_fresh_uuid_each_call() {
        let a = new_node_id();
        let b = new_node_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn find_node_by_id_searches_whole_tree() {
        let root = union("root", vec![cube("a"), cube("b")]);
        assert_eq!(find_node_by_id(&root, "b").unwrap().id, "b");
        assert!(find_node_by_id(&root, "missing").is_none());
    }

    #[test]
    fn find_parent_returns_direct_parent() {
        let root = union("root", vec![cube("a"), union("mid", vec![cube("c")])]);
        assert_eq!(find_parent(&root, "a").unwrap().id, "root");
        assert_eq!(find_parent(&root, "c").unwrap().id, "mid");
        assert!(find_parent(&root, "root").is_none());
    }

    #[test]
    fn find_direct_child_ancestor_walks_up_to_cursor_level() {
        let root = union("root", vec![union("group", vec![cube("leaf")])]);
        assert_eq!(
            find_direct_child_ancestor(&root, "leaf", "root").unwrap(),
            "group"
        );
        assert_eq!(
            find_direct_child_ancestor(&root, "leaf", "group").unwrap(),
            "leaf"
        );
    }

    #[test]
    fn replace_node_is_copy_on_write() {
        let root = union("root", vec![cube("a"), cube("b")]);
        let replaced = replace_node(&root, "a", cube("a2"));
        assert_eq!(replaced.children()[0].id, "a2");
        assert_eq!(replaced.children()[1].id, "b");
        // original untouched
        assert_eq!(root.children()[0].id, "a");
    }

    #[test]
    fn ancestor_transforms_are_root_to_target_order() {
        let scale = matrix_multiply(&IDENTITY, &IDENTITY);
        let inner = cube("inner").with_matrix(scale);
        let root = union("root", vec![inner]).with_matrix(IDENTITY);
        let transforms = get_ancestor_transforms(&root, "inner").unwrap();
        assert_eq!(transforms, vec![IDENTITY, scale]);
    }

    #[test]
    fn apply_transform_delta_left_multiplies() {
        let root = union("root", vec![cube("a")]);
        let updated = apply_transform_delta(&root, "a", &IDENTITY).unwrap();
        let node = find_node_by_id(&updated, "a").unwrap();
        assert_eq!(node.matrix, Some(IDENTITY));
    }

    #[test]
    fn has_children_distinguishes_leaves_from_parents() {
        assert!(!cube("a").has_children());
        assert!(union("root", vec![cube("a")]).has_children());
    }
}
