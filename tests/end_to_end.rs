//! End-to-end scenarios spanning the room actor, storage, and the client
//! transclusion resolver together — the kind of behavior that can't be
//! exercised from inside a single module's unit tests.

use std::time::Duration;

use manifold_studio_core::crdt::document::ROOT_ID;
use manifold_studio_core::crdt::Document;
use manifold_studio_core::csg::{FrontierPoint, Node, NodeKind, SizeSpec};
use manifold_studio_core::client::TranscludeResolver;
use manifold_studio_core::patcher;
use manifold_studio_core::room::service::RoomRegistry;
use manifold_studio_core::room::storage::{Storage, SEQ_KEY, SNAPSHOT_KEY};
use manifold_studio_core::room::{router, AppState};
use manifold_studio_core::wire::{self, S_CATCHUP, S_PEER_ID};

fn cube(id: &str) -> Node {
    Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
}

fn root(children: Vec<Node>) -> Node {
    Node::new(ROOT_ID, NodeKind::Group { children })
}

/// Binds the room HTTP/WebSocket router to an OS-assigned local port and
/// returns its base URL plus a handle to shut it down.
async fn spawn_service(registry: RoomRegistry) -> (String, tokio::task::JoinHandle<()>) {
    let app = router(AppState { rooms: registry });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), task)
}

#[tokio::test]
async fn reconnect_delivers_a_catchup_delta_that_converges_the_replica() {
    let storage = Storage::connect_in_memory().await.unwrap();
    let registry = RoomRegistry::new(storage);
    let room = "reconnect-room".to_string();
    let handle = registry.ensure_room(&room).await.unwrap();

    // Client connects once, notes nothing, then disconnects.
    let (first_peer, mut first_rx) = handle.connect().await;
    let frame = wire::decode_message(&first_rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame.tag, S_PEER_ID);
    assert_eq!(wire::decode_peer_id(&frame.payload).unwrap(), first_peer);
    handle.disconnect(first_peer).await;

    // A local replica that never saw any of this, as the client's view
    // while it was offline.
    let mut client_doc = Document::new();

    // Another peer edits the room while the client is away.
    let mut other_doc = Document::new();
    let ops = patcher::diff(&root(vec![]), &root(vec![cube("x")]));
    let update = other_doc.commit_local(42, ops, chrono::Utc::now()).unwrap();
    handle.update(42, update).await;

    // Client reconnects and hands over its (stale, empty) version vector.
    let (second_peer, mut second_rx) = handle.connect().await;
    second_rx.recv().await.unwrap(); // S_PEER_ID
    let vv_payload = bincode::serialize(&client_doc.version_vector()).unwrap();
    handle.version_vector(second_peer, vv_payload).await;

    let catchup = wire::decode_message(&second_rx.recv().await.unwrap()).unwrap();
    assert_eq!(catchup.tag, S_CATCHUP);

    client_doc.apply_update(&catchup.payload).unwrap();

    let server_snapshot = handle.snapshot(None).await.unwrap();
    let server_doc = Document::import_snapshot(&server_snapshot).unwrap();

    let mut server_children = server_doc.tree().children_of(&ROOT_ID.to_string()).to_vec();
    let mut client_children = client_doc.tree().children_of(&ROOT_ID.to_string()).to_vec();
    server_children.sort();
    client_children.sort();
    assert_eq!(client_children, vec!["x".to_string()]);
    assert_eq!(client_children, server_children);
}

#[tokio::test]
async fn pinned_transclusion_is_fetched_once_and_survives_the_source_going_away() {
    let storage = Storage::connect_in_memory().await.unwrap();
    let registry = RoomRegistry::new(storage);
    let library_room = "library".to_string();
    let handle = registry.ensure_room(&library_room).await.unwrap();

    let mut library_doc = Document::new();
    let ops = patcher::diff(&root(vec![]), &root(vec![cube("c1")]));
    let update = library_doc.commit_local(7, ops, chrono::Utc::now()).unwrap();
    handle.update(7, update).await;

    let (base_url, server_task) = spawn_service(registry).await;

    let transclude_root = root(vec![Node::new(
        "t1",
        NodeKind::Transclude {
            room_id: library_room.clone(),
            frontiers: Some(vec![FrontierPoint { peer: 7, counter: 0 }]),
        },
    )]);

    let resolver = TranscludeResolver::new(base_url);
    let first = resolver.resolve(&transclude_root).await;

    let library_subtree = &first.children()[0];
    assert_eq!(library_subtree.id, ROOT_ID);
    assert_eq!(library_subtree.children()[0].id, "c1");

    // The source room's HTTP server is gone; a pinned transclusion must be
    // served from cache rather than re-fetching.
    server_task.abort();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = resolver.resolve(&transclude_root).await;
    assert_eq!(second, first);
}

#[tokio::test]
async fn quiet_room_compacts_its_wal_after_the_alarm_fires() {
    let storage = Storage::connect_in_memory().await.unwrap();
    let compaction_delay = Duration::from_millis(120);
    let registry = RoomRegistry::with_compaction_delay(storage.clone(), compaction_delay);
    let room = "compaction-room".to_string();
    let handle = registry.ensure_room(&room).await.unwrap();

    // Keep a socket open throughout so compaction only happens via the
    // alarm, never via the disconnect-triggered path.
    let (peer, mut rx) = handle.connect().await;
    rx.recv().await.unwrap(); // S_PEER_ID

    let mut doc = Document::new();
    let mut previous = root(vec![]);
    for id in ["a", "b", "c"] {
        let next = {
            let mut children: Vec<Node> = previous.children().to_vec();
            children.push(cube(id));
            root(children)
        };
        let ops = patcher::diff(&previous, &next);
        let update = doc.commit_local(peer, ops, chrono::Utc::now()).unwrap();
        handle.update(peer, update).await;
        previous = next;
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    let wal_before = storage.list_prefix(&room, "update:").await.unwrap();
    assert!(wal_before.iter().any(|(k, _)| k.as_str() != SEQ_KEY), "updates should be durable before the alarm fires");

    tokio::time::sleep(compaction_delay * 3).await;

    let wal_after = storage.list_prefix(&room, "update:").await.unwrap();
    assert_eq!(wal_after.len(), 1, "only update:seq should remain after compaction");
    assert_eq!(wal_after[0].0, SEQ_KEY);

    let snapshot = storage.get(&room, SNAPSHOT_KEY).await.unwrap().expect("compaction writes a snapshot");
    let compacted = Document::import_snapshot(&snapshot).unwrap();
    let mut children = compacted.tree().children_of(&ROOT_ID.to_string()).to_vec();
    children.sort();
    assert_eq!(children, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
}
