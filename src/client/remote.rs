//! Ref-counted remote room subscriptions (§4.7 "Subscription lifecycle").
//!
//! Multiple transclusions of the same room id must share one replica and
//! one WebSocket rather than each opening their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::sync::{SyncConfig, SyncManager};
use crate::crdt::Document;
use crate::types::{PeerId, RoomId};

struct Subscription {
    document: Arc<Mutex<Document>>,
    /// Set once the sync loop has assigned a peer id (i.e. the cold-start
    /// snapshot fetch ran and the WebSocket handshake completed), so
    /// `is_ready` can tell "genuinely empty room" apart from "subscribed
    /// but still connecting".
    peer_id: Arc<Mutex<Option<PeerId>>>,
    ref_count: usize,
    stop_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Deduplicates WebSocket subscriptions to remote rooms across however many
/// local transclusions reference the same `roomId`.
#[derive(Clone, Default)]
pub struct RemoteRoomClient {
    base_url: String,
    subscriptions: Arc<Mutex<HashMap<RoomId, Subscription>>>,
}

impl RemoteRoomClient {
    pub fn new(base_url: String) -> Self {
        RemoteRoomClient { base_url, subscriptions: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Subscribe to `room_id`, returning the shared replica. The first
    /// subscriber creates the replica and opens the connection; later
    /// subscribers just bump the ref count.
    pub async fn subscribe(&self, room_id: &RoomId) -> Arc<Mutex<Document>> {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(sub) = subscriptions.get_mut(room_id) {
            sub.ref_count += 1;
            return sub.document.clone();
        }

        let document = Arc::new(Mutex::new(Document::new()));
        let peer_id = Arc::new(Mutex::new(None));
        let config = SyncConfig { base_url: self.base_url.clone(), room_id: room_id.clone() };
        let manager = SyncManager::new(config, document.clone(), peer_id.clone());
        let stop_flag = manager.stop_handle();
        let task = tokio::spawn(async move {
            let _ = manager.run().await;
        });

        subscriptions.insert(room_id.clone(), Subscription { document: document.clone(), peer_id, ref_count: 1, stop_flag, task });
        document
    }

    /// Whether `room_id`'s sync loop has completed its initial handshake.
    /// Until then its replica is just the fresh, still-bootstrap `Document`
    /// every subscription starts from, not yet the room's real content.
    pub async fn is_ready(&self, room_id: &RoomId) -> bool {
        let subscriptions = self.subscriptions.lock().await;
        match subscriptions.get(room_id) {
            Some(sub) => sub.peer_id.lock().await.is_some(),
            None => false,
        }
    }

    /// Decrement the ref count for `room_id`; at zero, stop the sync loop
    /// and drop the replica.
    pub async fn unsubscribe(&self, room_id: &RoomId) {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(sub) = subscriptions.get_mut(room_id) else { return };
        sub.ref_count = sub.ref_count.saturating_sub(1);
        if sub.ref_count == 0 {
            let sub = subscriptions.remove(room_id).expect("just checked present");
            sub.stop_flag.store(true, Ordering::SeqCst);
            sub.task.abort();
        }
    }

    pub async fn ref_count(&self, room_id: &RoomId) -> usize {
        self.subscriptions.lock().await.get(room_id).map(|s| s.ref_count).unwrap_or(0)
    }
}
