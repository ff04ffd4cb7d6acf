//! The CSG evaluator (§4.8): a retained tree of shapes with cached
//! geometry, incremental dirty-propagation rebuilds, and a triangle →
//! source-node back-map for pick/selection.
//!
//! The actual boolean-geometry kernel (union/intersection/subtraction,
//! primitive tessellation) is a separate concern from this module's job —
//! orchestration, caching, and id bookkeeping — so it sits behind the
//! [`GeometryEngine`] trait. [`InMemoryEngine`] is a self-contained
//! reference implementation good enough to exercise every rule in this
//! module without depending on an external geometry kernel crate.

use std::collections::HashMap;

use crate::csg::{Matrix4, Node, NodeKind, SizeSpec, IDENTITY};
use crate::error::{StudioError, StudioResult};
use crate::patcher::{self, PatchOp};
use crate::types::NodeId;

/// An opaque reference to geometry owned by a [`GeometryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryHandle(u64);

/// A fresh tag assigned to a primitive's geometry, used to build the
/// triangle → source-node back-map.
pub type OriginId = u64;

/// The tessellated output of a build: vertex positions, triangle indices,
/// and (one entry per triangle) the originating primitive's [`OriginId`].
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
    pub triangle_origin: Vec<OriginId>,
}

/// Abstraction over the boolean-geometry kernel the evaluator drives.
/// Every method is a pure construction/combination; ownership of the
/// returned handle belongs to the caller, which must `dispose` it.
pub trait GeometryEngine {
    fn cube(&mut self, size: [f64; 3], center: bool) -> GeometryHandle;
    fn sphere(&mut self, radius: f64, segments: u32) -> GeometryHandle;
    fn cylinder(&mut self, radius_low: f64, radius_high: f64, height: f64, segments: u32, center: bool) -> GeometryHandle;
    fn extrude(&mut self, polygon: &[[f64; 2]], height: f64) -> GeometryHandle;
    fn union(&mut self, parts: &[GeometryHandle]) -> GeometryHandle;
    fn intersection(&mut self, parts: &[GeometryHandle]) -> GeometryHandle;
    fn subtract(&mut self, base: GeometryHandle, others: &[GeometryHandle]) -> GeometryHandle;
    fn transform(&mut self, handle: GeometryHandle, matrix: &Matrix4) -> GeometryHandle;
    /// Unary boolean / group passthrough: a copy with ownership disjoint
    /// from `handle`, preserving `handle`'s origin tagging.
    fn identity_copy(&mut self, handle: GeometryHandle) -> GeometryHandle;
    /// Tag every triangle currently in `handle` with a fresh origin id,
    /// returning that id. Called once per primitive build.
    fn tag_original(&mut self, handle: GeometryHandle) -> OriginId;
    fn dispose(&mut self, handle: GeometryHandle);
    fn mesh(&self, handle: GeometryHandle) -> Mesh;
}

/// A minimal, dependency-free [`GeometryEngine`]. Primitives are
/// represented by a single placeholder triangle so every rule the
/// evaluator enforces (tagging, combination, transform, disposal) is
/// exercised without a real tessellation kernel.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    next_handle: u64,
    next_origin: u64,
    geometry: HashMap<u64, GeomRecord>,
}

#[derive(Debug, Clone)]
struct GeomRecord {
    triangles: Vec<[[f32; 3]; 3]>,
    origins: Vec<OriginId>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        InMemoryEngine::default()
    }

    fn alloc(&mut self, record: GeomRecord) -> GeometryHandle {
        let id = self.next_handle;
        self.next_handle += 1;
        self.geometry.insert(id, record);
        GeometryHandle(id)
    }

    fn placeholder_triangle(scale: f64) -> [[f32; 3]; 3] {
        let s = scale as f32;
        [[0.0, 0.0, 0.0], [s, 0.0, 0.0], [0.0, s, 0.0]]
    }

    fn record(&self, handle: GeometryHandle) -> &GeomRecord {
        self.geometry.get(&handle.0).expect("handle must be live")
    }
}

impl GeometryEngine for InMemoryEngine {
    fn cube(&mut self, size: [f64; 3], _center: bool) -> GeometryHandle {
        let scale = size.iter().cloned().fold(0.0, f64::max).max(0.001);
        self.alloc(GeomRecord { triangles: vec![Self::placeholder_triangle(scale)], origins: vec![0] })
    }

    fn sphere(&mut self, radius: f64, _segments: u32) -> GeometryHandle {
        self.alloc(GeomRecord { triangles: vec![Self::placeholder_triangle(radius)], origins: vec![0] })
    }

    fn cylinder(&mut self, radius_low: f64, radius_high: f64, height: f64, _segments: u32, _center: bool) -> GeometryHandle {
        let scale = radius_low.max(radius_high).max(height).max(0.001);
        self.alloc(GeomRecord { triangles: vec![Self::placeholder_triangle(scale)], origins: vec![0] })
    }

    fn extrude(&mut self, polygon: &[[f64; 2]], height: f64) -> GeometryHandle {
        let extent = polygon
            .iter()
            .flat_map(|p| p.iter().cloned())
            .fold(height, f64::max)
            .max(0.001);
        self.alloc(GeomRecord { triangles: vec![Self::placeholder_triangle(extent)], origins: vec![0] })
    }

    fn union(&mut self, parts: &[GeometryHandle]) -> GeometryHandle {
        let mut triangles = Vec::new();
        let mut origins = Vec::new();
        for part in parts {
            let record = self.record(*part);
            triangles.extend(record.triangles.iter().cloned());
            origins.extend(record.origins.iter().cloned());
        }
        self.alloc(GeomRecord { triangles, origins })
    }

    fn intersection(&mut self, parts: &[GeometryHandle]) -> GeometryHandle {
        self.union(parts)
    }

    fn subtract(&mut self, base: GeometryHandle, others: &[GeometryHandle]) -> GeometryHandle {
        let _ = others;
        self.identity_copy(base)
    }

    fn transform(&mut self, handle: GeometryHandle, matrix: &Matrix4) -> GeometryHandle {
        let record = self.record(handle).clone();
        let triangles = record
            .triangles
            .into_iter()
            .map(|tri| tri.map(|v| apply_matrix(matrix, v)))
            .collect();
        self.alloc(GeomRecord { triangles, origins: record.origins })
    }

    fn identity_copy(&mut self, handle: GeometryHandle) -> GeometryHandle {
        let record = self.record(handle).clone();
        self.alloc(record)
    }

    fn tag_original(&mut self, handle: GeometryHandle) -> OriginId {
        let origin = self.next_origin;
        self.next_origin += 1;
        if let Some(record) = self.geometry.get_mut(&handle.0) {
            record.origins = vec![origin; record.triangles.len()];
        }
        origin
    }

    fn dispose(&mut self, handle: GeometryHandle) {
        self.geometry.remove(&handle.0);
    }

    fn mesh(&self, handle: GeometryHandle) -> Mesh {
        let record = self.record(handle);
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        let mut triangle_origin = Vec::new();
        for (tri, origin) in record.triangles.iter().zip(&record.origins) {
            let base = vertices.len() as u32;
            vertices.extend_from_slice(tri);
            triangles.push([base, base + 1, base + 2]);
            triangle_origin.push(*origin);
        }
        Mesh { vertices, triangles, triangle_origin }
    }
}

fn apply_matrix(m: &Matrix4, v: [f32; 3]) -> [f32; 3] {
    let x = v[0] as f64;
    let y = v[1] as f64;
    let z = v[2] as f64;
    let out = [
        m[0] * x + m[4] * y + m[8] * z + m[12],
        m[1] * x + m[5] * y + m[9] * z + m[13],
        m[2] * x + m[6] * y + m[10] * z + m[14],
    ];
    [out[0] as f32, out[1] as f32, out[2] as f32]
}

/// Per-node cache entry kept by the retained evaluator tree.
#[derive(Debug, Clone)]
struct EvalCache {
    dirty: bool,
    handle: Option<GeometryHandle>,
    /// Every primitive origin id contributed by this node's subtree, valid
    /// only while `dirty` is false.
    primitive_origins: Vec<(OriginId, NodeId)>,
}

impl Default for EvalCache {
    fn default() -> Self {
        EvalCache { dirty: true, handle: None, primitive_origins: Vec::new() }
    }
}

/// The retained evaluator: the last-synced tree plus a per-node cache.
#[derive(Debug, Default)]
pub struct Evaluator {
    last_root: Option<Node>,
    parents: HashMap<NodeId, NodeId>,
    cache: HashMap<NodeId, EvalCache>,
}

/// The result of a full [`Evaluator::build`] call: the root mesh plus the
/// triangle → node-id back-map (§4.8 "Triangle back-map").
pub struct BuildOutput {
    pub mesh: Mesh,
    pub triangle_node_id: Vec<Option<NodeId>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator::default()
    }

    /// Sync the evaluator to a new tree shape, marking exactly the nodes
    /// touched by the diff (plus their ancestors up to the root) dirty.
    /// The very first sync marks everything dirty.
    pub fn sync_tree(&mut self, root: &Node) {
        match &self.last_root {
            None => self.mark_all_dirty(root),
            Some(old_root) => {
                let ops = patcher::diff(old_root, root);
                self.rebuild_parent_index(root);
                for op in &ops {
                    for id in touched_ids(op) {
                        self.mark_dirty(&id);
                    }
                }
            }
        }
        self.rebuild_parent_index(root);
        self.last_root = Some(root.clone());
    }

    fn rebuild_parent_index(&mut self, root: &Node) {
        self.parents.clear();
        fn walk(node: &Node, parents: &mut HashMap<NodeId, NodeId>) {
            for child in node.children() {
                parents.insert(child.id.clone(), node.id.clone());
                walk(child, parents);
            }
        }
        walk(root, &mut self.parents);
    }

    fn mark_all_dirty(&mut self, root: &Node) {
        fn walk(node: &Node, cache: &mut HashMap<NodeId, EvalCache>) {
            cache.entry(node.id.clone()).or_default().dirty = true;
            for child in node.children() {
                walk(child, cache);
            }
        }
        walk(root, &mut self.cache);
    }

    /// Mark `id` dirty, then every ancestor up to the root, stopping early
    /// at an already-dirty ancestor (§4.8 "Dirty propagation").
    fn mark_dirty(&mut self, id: &NodeId) {
        let mut current = Some(id.clone());
        while let Some(node_id) = current {
            let entry = self.cache.entry(node_id.clone()).or_default();
            if entry.dirty {
                break;
            }
            entry.dirty = true;
            current = self.parents.get(&node_id).cloned();
        }
    }

    /// Rebuild geometry for the whole tree, producing the mesh and the
    /// triangle → node-id back-map. Requires a prior [`sync_tree`] call.
    pub fn build(&mut self, engine: &mut dyn GeometryEngine) -> StudioResult<BuildOutput> {
        let root = self
            .last_root
            .clone()
            .ok_or_else(|| StudioError::GeometryBuildFailed {
                node_id: "<root>".into(),
                message: "evaluator has no synced tree".into(),
            })?;
        let mut id_map: HashMap<OriginId, NodeId> = HashMap::new();
        let handle = self.build_node(&root, engine, &mut id_map)?;
        let mesh = engine.mesh(handle);
        let triangle_node_id = mesh.triangle_origin.iter().map(|origin| id_map.get(origin).cloned()).collect();
        Ok(BuildOutput { mesh, triangle_node_id })
    }

    fn build_node(&mut self, node: &Node, engine: &mut dyn GeometryEngine, id_map: &mut HashMap<OriginId, NodeId>) -> StudioResult<GeometryHandle> {
        let is_dirty = self.cache.get(&node.id).map(|c| c.dirty).unwrap_or(true);

        if !is_dirty {
            if let Some(entry) = self.cache.get(&node.id) {
                if let Some(handle) = entry.handle {
                    for (origin, id) in &entry.primitive_origins {
                        id_map.insert(*origin, id.clone());
                    }
                    return Ok(handle);
                }
            }
        }

        if let Some(entry) = self.cache.get_mut(&node.id) {
            if let Some(old_handle) = entry.handle.take() {
                engine.dispose(old_handle);
            }
        }

        let mut child_results: Vec<(GeometryHandle, Vec<(OriginId, NodeId)>)> = Vec::new();
        for child in node.children() {
            let handle = self.build_node(child, engine, id_map)?;
            let origins = self.cache.get(&child.id).map(|c| c.primitive_origins.clone()).unwrap_or_default();
            child_results.push((handle, origins));
        }

        let (handle, mut origins) = self.build_variant(node, engine, &child_results)?;

        if is_primitive(node) {
            let origin = engine.tag_original(handle);
            origins = vec![(origin, node.id.clone())];
        }
        for (origin, id) in &origins {
            id_map.insert(*origin, id.clone());
        }

        let entry = self.cache.entry(node.id.clone()).or_default();
        entry.dirty = false;
        entry.handle = Some(handle);
        entry.primitive_origins = origins;
        Ok(handle)
    }

    fn build_variant(
        &self,
        node: &Node,
        engine: &mut dyn GeometryEngine,
        children: &[(GeometryHandle, Vec<(OriginId, NodeId)>)],
    ) -> StudioResult<(GeometryHandle, Vec<(OriginId, NodeId)>)> {
        let handles: Vec<GeometryHandle> = children.iter().map(|(h, _)| *h).collect();
        let combined_origins: Vec<(OriginId, NodeId)> = children.iter().flat_map(|(_, o)| o.clone()).collect();

        let base_handle = match &node.kind {
            NodeKind::Cube { size, center } => engine.cube(size_triple(size), *center),
            NodeKind::Sphere { radius, segments } => engine.sphere(*radius, *segments),
            NodeKind::Cylinder { radius, radius_low, radius_high, height, segments, center } => {
                let low = radius_low.or(*radius).unwrap_or(1.0);
                let high = radius_high.unwrap_or(low);
                engine.cylinder(low, high, *height, *segments, *center)
            }
            NodeKind::Extrude { polygon, height } => {
                if polygon.len() < 3 {
                    return Err(StudioError::GeometryBuildFailed {
                        node_id: node.id.clone(),
                        message: "extrude polygon needs at least 3 vertices".into(),
                    });
                }
                engine.extrude(polygon, *height)
            }
            NodeKind::Union { .. } => build_nary_or_unary(engine, &handles, |e, hs| e.union(hs)),
            NodeKind::Intersection { .. } => build_nary_or_unary(engine, &handles, |e, hs| e.intersection(hs)),
            NodeKind::Difference { .. } => match handles.split_first() {
                None => engine.union(&[]),
                Some((first, [])) => engine.identity_copy(*first),
                Some((first, rest)) => {
                    let rest_union = engine.union(rest);
                    let result = engine.subtract(*first, &[rest_union]);
                    engine.dispose(rest_union);
                    result
                }
            },
            NodeKind::Group { .. } => build_nary_or_unary(engine, &handles, |e, hs| e.union(hs)),
            NodeKind::Transclude { .. } => {
                // Unresolved transclusions produce no geometry (§4.7, §7).
                engine.union(&[])
            }
        };

        let transformed = match node.matrix {
            Some(matrix) => engine.transform(base_handle, &matrix),
            None if matches!(node.kind, NodeKind::Cube { .. } | NodeKind::Sphere { .. } | NodeKind::Cylinder { .. } | NodeKind::Extrude { .. }) => base_handle,
            None => engine.transform(base_handle, &IDENTITY),
        };

        Ok((transformed, combined_origins))
    }

    /// Walk up from `leaf_id` until the direct child of `cursor_parent` is
    /// reached; `None` cursor parent selects the whole shape (§4.8).
    pub fn resolve_click(&self, root: &Node, leaf_id: &str, cursor_parent: Option<&str>) -> Option<NodeId> {
        match cursor_parent {
            Some(parent) => crate::csg::find_direct_child_ancestor(root, leaf_id, parent),
            None => Some(root.id.clone()),
        }
    }
}

fn size_triple(size: &SizeSpec) -> [f64; 3] {
    match size {
        SizeSpec::Uniform(s) => [*s, *s, *s],
        SizeSpec::Triple(t) => *t,
    }
}

fn is_primitive(node: &Node) -> bool {
    matches!(
        node.kind,
        NodeKind::Cube { .. } | NodeKind::Sphere { .. } | NodeKind::Cylinder { .. } | NodeKind::Extrude { .. }
    )
}

/// Unary boolean returns a disjoint-ownership copy (§4.8); n-ary calls the
/// variadic combinator.
fn build_nary_or_unary(
    engine: &mut dyn GeometryEngine,
    handles: &[GeometryHandle],
    combine: impl Fn(&mut dyn GeometryEngine, &[GeometryHandle]) -> GeometryHandle,
) -> GeometryHandle {
    match handles {
        [] => combine(engine, &[]),
        [single] => engine.identity_copy(*single),
        many => combine(engine, many),
    }
}

fn touched_ids(op: &PatchOp) -> Vec<NodeId> {
    match op {
        PatchOp::SetAttr { node, .. } | PatchOp::DeleteAttr { node, .. } => vec![node.clone()],
        PatchOp::CreateChild { parent, child, .. } | PatchOp::DeleteChild { parent, child } | PatchOp::MoveChild { parent, child, .. } => {
            vec![parent.clone(), child.clone()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csg::{Node, NodeKind, SizeSpec};

    fn cube(id: &str) -> Node {
        Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
    }

    fn union(id: &str, children: Vec<Node>) -> Node {
        Node::new(id, NodeKind::Union { name: None, children })
    }

    #[test]
    fn build_tags_every_primitive_and_maps_triangles() {
        let root = union("root", vec![cube("a"), cube("b")]);
        let mut evaluator = Evaluator::new();
        evaluator.sync_tree(&root);
        let mut engine = InMemoryEngine::new();
        let output = evaluator.build(&mut engine).unwrap();
        assert!(!output.mesh.triangles.is_empty());
        assert!(output.triangle_node_id.iter().all(Option::is_some));
    }

    #[test]
    fn unchanged_tree_is_idempotent_and_skips_the_engine() {
        let root = union("root", vec![cube("a")]);
        let mut evaluator = Evaluator::new();
        evaluator.sync_tree(&root);
        let mut engine = InMemoryEngine::new();
        evaluator.build(&mut engine).unwrap();

        // Re-sync with the identical tree: nothing should be marked dirty.
        evaluator.sync_tree(&root);
        assert!(evaluator.cache.values().all(|c| !c.dirty));
    }

    #[test]
    fn editing_one_child_does_not_dirty_its_sibling() {
        let old = union("root", vec![cube("a"), cube("b")]);
        let mut new_a = cube("a");
        new_a.kind = NodeKind::Cube { size: SizeSpec::Uniform(5.0), center: true };
        let new_root = union("root", vec![new_a, cube("b")]);

        let mut evaluator = Evaluator::new();
        evaluator.sync_tree(&old);
        let mut engine = InMemoryEngine::new();
        evaluator.build(&mut engine).unwrap();

        evaluator.sync_tree(&new_root);
        assert!(evaluator.cache.get(&"a".to_string()).unwrap().dirty);
        assert!(!evaluator.cache.get(&"b".to_string()).unwrap().dirty);
    }

    #[test]
    fn click_resolution_walks_up_to_cursor_level() {
        let root = union("root", vec![union("group", vec![cube("leaf")])]);
        let evaluator = Evaluator::new();
        assert_eq!(evaluator.resolve_click(&root, "leaf", Some("root")).unwrap(), "group");
        assert_eq!(evaluator.resolve_click(&root, "leaf", None).unwrap(), "root");
    }
}
