//! Transclusion resolver (§4.7): replaces `transclude` nodes in a local CSG
//! tree with the referenced room's tree, recursively, tracking cycles,
//! depth, and the live/pinned subscription lifecycle.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::client::remote::RemoteRoomClient;
use crate::crdt::Document;
use crate::csg::{FrontierPoint, Node, NodeKind};
use crate::types::RoomId;

const DEFAULT_MAX_DEPTH: usize = 8;

type PinnedKey = (RoomId, Vec<(u64, u64)>);

/// Rooms a resolve pass is currently holding, each subscribed to at most
/// once regardless of how many transclude nodes reference it.
type LiveRooms = HashMap<RoomId, Arc<Mutex<Document>>>;

/// Resolves transclusions against a [`RemoteRoomClient`], managing the
/// ref-counted live subscriptions that back un-pinned `transclude` nodes.
pub struct TranscludeResolver {
    base_url: String,
    remote: RemoteRoomClient,
    pinned_cache: Mutex<HashMap<PinnedKey, Node>>,
    /// Rooms this resolver currently holds exactly one live-subscription
    /// ref for, as of the previous `resolve` call. `resolve_live` consults
    /// this before subscribing so a room referenced across many passes
    /// keeps a single ref rather than accumulating one per pass; `reconcile`
    /// unsubscribes whatever drops out and replaces this set with the one
    /// just discovered.
    live_rooms: Mutex<LiveRooms>,
    max_depth: usize,
}

impl TranscludeResolver {
    pub fn new(base_url: String) -> Self {
        TranscludeResolver {
            remote: RemoteRoomClient::new(base_url.clone()),
            base_url,
            pinned_cache: Mutex::new(HashMap::new()),
            live_rooms: Mutex::new(LiveRooms::new()),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Produce a tree structurally safe to evaluate: every resolvable
    /// `transclude` node replaced by its referenced tree. Also reconciles
    /// which rooms this resolver holds a live subscription to, so repeated
    /// calls as the local tree changes track additions/removals of
    /// transclude nodes.
    pub async fn resolve(&self, root: &Node) -> Node {
        let mut visited = HashSet::new();
        let mut discovered = LiveRooms::new();
        let resolved = self.resolve_node(root, &mut visited, 0, &mut discovered).await;
        self.reconcile_live_subscriptions(discovered).await;
        resolved
    }

    /// Unsubscribe rooms held as of the previous pass but not referenced by
    /// this one, then adopt `discovered` (every room `resolve_live` touched
    /// this pass, each already subscribed exactly once) as the new held set.
    async fn reconcile_live_subscriptions(&self, discovered: LiveRooms) {
        let mut live = self.live_rooms.lock().await;
        let stale: Vec<RoomId> = live.keys().filter(|id| !discovered.contains_key(*id)).cloned().collect();
        for room_id in &stale {
            self.remote.unsubscribe(room_id).await;
        }
        *live = discovered;
    }

    fn resolve_node<'a>(
        &'a self,
        node: &'a Node,
        visited: &'a mut HashSet<RoomId>,
        depth: usize,
        live: &'a mut LiveRooms,
    ) -> Pin<Box<dyn Future<Output = Node> + Send + 'a>> {
        Box::pin(async move {
            match &node.kind {
                NodeKind::Transclude { room_id, frontiers } => {
                    self.resolve_transclude(node, room_id, frontiers, visited, depth, live).await
                }
                NodeKind::Union { name, children } => {
                    let resolved = self.resolve_children(children, visited, depth, live).await;
                    Node { id: node.id.clone(), kind: NodeKind::Union { name: name.clone(), children: resolved }, matrix: node.matrix }
                }
                NodeKind::Difference { name, children } => {
                    let resolved = self.resolve_children(children, visited, depth, live).await;
                    Node { id: node.id.clone(), kind: NodeKind::Difference { name: name.clone(), children: resolved }, matrix: node.matrix }
                }
                NodeKind::Intersection { name, children } => {
                    let resolved = self.resolve_children(children, visited, depth, live).await;
                    Node { id: node.id.clone(), kind: NodeKind::Intersection { name: name.clone(), children: resolved }, matrix: node.matrix }
                }
                NodeKind::Group { children } => {
                    let resolved = self.resolve_children(children, visited, depth, live).await;
                    Node { id: node.id.clone(), kind: NodeKind::Group { children: resolved }, matrix: node.matrix }
                }
                _ => node.clone(),
            }
        })
    }

    async fn resolve_children<'a>(&'a self, children: &'a [Node], visited: &'a mut HashSet<RoomId>, depth: usize, live: &'a mut LiveRooms) -> Vec<Node> {
        let mut resolved = Vec::with_capacity(children.len());
        for child in children {
            resolved.push(self.resolve_node(child, visited, depth, live).await);
        }
        resolved
    }

    async fn resolve_transclude(
        &self,
        node: &Node,
        room_id: &RoomId,
        frontiers: &Option<Vec<FrontierPoint>>,
        visited: &mut HashSet<RoomId>,
        depth: usize,
        live: &mut LiveRooms,
    ) -> Node {
        if depth >= self.max_depth {
            return node.clone();
        }
        if visited.contains(room_id) {
            warn!(room_id = room_id.as_str(), "transclusion cycle detected; substituting empty group");
            return Node { id: node.id.clone(), kind: NodeKind::Group { children: vec![] }, matrix: node.matrix };
        }

        let fetched = match frontiers {
            Some(points) => self.resolve_pinned(room_id, points).await,
            None => self.resolve_live(room_id, live).await,
        };

        let Some(tree) = fetched else {
            // Not yet loaded: leave the node in place for partial resolution;
            // it produces no geometry until a later resolve picks it up.
            return node.clone();
        };

        visited.insert(room_id.clone());
        let mut resolved = self.resolve_node(&tree, visited, depth + 1, live).await;
        visited.remove(room_id);

        resolved.matrix = node.matrix.or(resolved.matrix);
        resolved
    }

    /// Subscribe at most once per room, ever, while it stays referenced:
    /// reuse the previous pass's ref (`self.live_rooms`) if this room was
    /// already held, only calling `remote.subscribe` (which bumps the ref
    /// count) for a room neither this pass nor the last one has touched yet.
    async fn resolve_live(&self, room_id: &RoomId, discovered: &mut LiveRooms) -> Option<Node> {
        let document = match discovered.get(room_id) {
            Some(document) => document.clone(),
            None => {
                let held = self.live_rooms.lock().await.get(room_id).cloned();
                let document = match held {
                    Some(document) => document,
                    None => self.remote.subscribe(room_id).await,
                };
                discovered.insert(room_id.clone(), document.clone());
                document
            }
        };

        if !self.remote.is_ready(room_id).await {
            // Subscribed, but the cold-start snapshot fetch / WebSocket
            // handshake hasn't completed yet: leave the node in place
            // rather than resolving to the replica's still-bootstrap empty
            // tree, which would misreport "not yet loaded" as "empty" (§4.7).
            return None;
        }

        let document = document.lock().await;
        let root_id = document.tree().root()?.clone();
        document.tree().export(&root_id).ok()
    }

    async fn resolve_pinned(&self, room_id: &RoomId, points: &[FrontierPoint]) -> Option<Node> {
        let mut sorted: Vec<(u64, u64)> = points.iter().map(|p| (p.peer, p.counter)).collect();
        sorted.sort_unstable();
        let key = (room_id.clone(), sorted.clone());

        if let Some(cached) = self.pinned_cache.lock().await.get(&key) {
            return Some(cached.clone());
        }

        let url = format!(
            "{}/rooms/{}/snapshot?at={}",
            self.base_url.trim_end_matches('/'),
            room_id,
            crate::types::Frontier::new(sorted).to_query_string(),
        );
        let bytes = reqwest::get(url).await.ok()?.bytes().await.ok()?;
        let document = Document::import_snapshot(&bytes).ok()?;
        let root_id = document.tree().root()?.clone();
        let tree = document.tree().export(&root_id).ok()?;

        self.pinned_cache.lock().await.insert(key, tree.clone());
        Some(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csg::SizeSpec;

    fn cube(id: &str) -> Node {
        Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
    }

    #[tokio::test]
    async fn unreachable_transclude_is_left_in_place() {
        let resolver = TranscludeResolver::new("http://localhost:0".into());
        let root = Node::new(
            "root",
            NodeKind::Group { children: vec![Node::new("t1", NodeKind::Transclude { room_id: "other-room".into(), frontiers: None })] },
        );
        let resolved = resolver.resolve(&root).await;
        assert_eq!(resolved.children()[0].id, "t1");
        assert!(matches!(resolved.children()[0].kind, NodeKind::Transclude { .. }));
    }

    #[tokio::test]
    async fn non_transclude_tree_passes_through_unchanged() {
        let resolver = TranscludeResolver::new("http://localhost:0".into());
        let root = Node::new("root", NodeKind::Group { children: vec![cube("a")] });
        let resolved = resolver.resolve(&root).await;
        assert_eq!(resolved, root);
    }

    #[tokio::test]
    async fn a_room_referenced_across_many_passes_holds_exactly_one_ref() {
        let resolver = TranscludeResolver::new("http://localhost:0".into());
        let room: RoomId = "other-room".into();
        let with_transclude = Node::new(
            "root",
            NodeKind::Group { children: vec![Node::new("t1", NodeKind::Transclude { room_id: room.clone(), frontiers: None })] },
        );

        resolver.resolve(&with_transclude).await;
        assert_eq!(resolver.remote.ref_count(&room).await, 1);

        // Resolving the same tree again must not bump the ref a second time.
        resolver.resolve(&with_transclude).await;
        resolver.resolve(&with_transclude).await;
        assert_eq!(resolver.remote.ref_count(&room).await, 1);

        // Once the transclude drops out of the tree, the ref is released.
        let without_transclude = Node::new("root", NodeKind::Group { children: vec![] });
        resolver.resolve(&without_transclude).await;
        assert_eq!(resolver.remote.ref_count(&room).await, 0);
    }

    #[tokio::test]
    async fn depth_limit_leaves_transclude_unresolved_beyond_max() {
        let resolver = TranscludeResolver::new("http://localhost:0".into());
        let mut visited = HashSet::new();
        let mut live = LiveRooms::new();
        let node = Node::new("t1", NodeKind::Transclude { room_id: "deep".into(), frontiers: None });
        let resolved = resolver.resolve_node(&node, &mut visited, DEFAULT_MAX_DEPTH, &mut live).await;
        assert_eq!(resolved, node);
    }
}
