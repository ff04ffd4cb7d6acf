//! The per-room actor (§4.4, §5): owns one room's authoritative replica,
//! serialising `hydrate`, update-handling, catch-up, awareness relay, and
//! compaction against each other. Different rooms run on independent tasks
//! and share no mutable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::crdt::change::HistoryEntry;
use crate::crdt::Document;
use crate::error::StudioResult;
use crate::room::storage::{update_key, Storage, SEQ_KEY, SNAPSHOT_KEY};
use crate::types::{Frontier, PeerId, RoomId};
use crate::wire::{self, S_AWARENESS, S_CATCHUP, S_PEER_ID, S_UPDATE};

enum Command {
    Connect { respond_to: oneshot::Sender<(PeerId, mpsc::UnboundedReceiver<Vec<u8>>)> },
    Update { peer: PeerId, payload: Vec<u8> },
    VersionVector { peer: PeerId, payload: Vec<u8> },
    Awareness { peer: PeerId, payload: Vec<u8> },
    Disconnect { peer: PeerId },
    Snapshot { at: Option<Frontier>, respond_to: oneshot::Sender<StudioResult<Vec<u8>>> },
    History { respond_to: oneshot::Sender<Vec<HistoryEntry>> },
    CompactionAlarm { generation: u64 },
}

/// A cheap, cloneable reference to a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::Sender<Command>,
}

impl RoomHandle {
    /// Ensure a socket is fully connected and wired: assigns a peer id and
    /// returns the receiver the socket task should drain for outbound
    /// frames, with S_PEER_ID already the first thing in the queue (§5
    /// ordering rule 3).
    pub async fn connect(&self) -> (PeerId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Connect { respond_to }).await;
        rx.await.expect("room actor dropped without responding")
    }

    pub async fn update(&self, peer: PeerId, payload: Vec<u8>) {
        let _ = self.tx.send(Command::Update { peer, payload }).await;
    }

    pub async fn version_vector(&self, peer: PeerId, payload: Vec<u8>) {
        let _ = self.tx.send(Command::VersionVector { peer, payload }).await;
    }

    pub async fn awareness(&self, peer: PeerId, payload: Vec<u8>) {
        let _ = self.tx.send(Command::Awareness { peer, payload }).await;
    }

    pub async fn disconnect(&self, peer: PeerId) {
        let _ = self.tx.send(Command::Disconnect { peer }).await;
    }

    pub async fn snapshot(&self, at: Option<Frontier>) -> StudioResult<Vec<u8>> {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Snapshot { at, respond_to }).await;
        rx.await.expect("room actor dropped without responding")
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        let (respond_to, rx) = oneshot::channel();
        let _ = self.tx.send(Command::History { respond_to }).await;
        rx.await.unwrap_or_default()
    }
}

/// An open socket's outbound channel. `S_PEER_ID` is always the first frame
/// queued (before the socket is registered here), so every registered
/// socket is already identified by the time it can receive a broadcast.
struct Socket {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Actor {
    room_id: RoomId,
    storage: Storage,
    document: Document,
    next_seq: u64,
    sockets: HashMap<PeerId, Socket>,
    dirty: bool,
    compaction_generation: u64,
    compaction_delay: Duration,
    self_tx: mpsc::Sender<Command>,
}

impl Actor {
    async fn hydrate(room_id: &str, storage: &Storage) -> StudioResult<(Document, u64)> {
        let mut document = match storage.get(room_id, SNAPSHOT_KEY).await? {
            Some(bytes) => Document::import_snapshot(&bytes)?,
            None => Document::new(),
        };

        let seq = match storage.get(room_id, SEQ_KEY).await? {
            Some(bytes) => decode_seq(&bytes),
            None => 0,
        };

        let entries = storage.list_prefix(room_id, "update:").await?;
        let mut replayed = false;
        for (key, value) in entries {
            if key == SEQ_KEY {
                continue;
            }
            // An update that fails to decode can only have reached the WAL
            // from a bug elsewhere (`handle_update` now imports before it
            // persists); skip rather than propagate so one bad entry can't
            // keep the room from ever hydrating again.
            match document.apply_update(&value) {
                Ok(()) => replayed = true,
                Err(err) => warn!(room_id, key = %key, %err, "skipping undecodable WAL entry during hydration"),
            }
        }

        if replayed {
            Self::compact_into(room_id, storage, &mut document).await?;
        }

        Ok((document, seq))
    }

    async fn compact_into(room_id: &str, storage: &Storage, document: &mut Document) -> StudioResult<()> {
        let snapshot = document.compact()?;
        storage.put(room_id, SNAPSHOT_KEY, &snapshot).await?;
        storage.delete_prefix(room_id, "update:").await?;
        storage.put(room_id, SEQ_KEY, &encode_seq(0)).await?;
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Connect { respond_to } => self.handle_connect(respond_to).await,
                Command::Update { peer, payload } => self.handle_update(peer, payload).await,
                Command::VersionVector { peer, payload } => self.handle_version_vector(peer, payload),
                Command::Awareness { peer, payload } => self.handle_awareness(peer, payload),
                Command::Disconnect { peer } => self.handle_disconnect(peer).await,
                Command::Snapshot { at, respond_to } => {
                    let _ = respond_to.send(self.handle_snapshot(at));
                }
                Command::History { respond_to } => {
                    let _ = respond_to.send(self.document.history());
                }
                Command::CompactionAlarm { generation } => self.handle_alarm(generation).await,
            }
        }
    }

    async fn handle_connect(&mut self, respond_to: oneshot::Sender<(PeerId, mpsc::UnboundedReceiver<Vec<u8>>)>) {
        let peer_id: PeerId = rand::random();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(wire::peer_id_frame(peer_id));
        self.sockets.insert(peer_id, Socket { tx });
        let _ = respond_to.send((peer_id, rx));
    }

    async fn handle_update(&mut self, peer: PeerId, payload: Vec<u8>) {
        // §7 "malformed remote update": import locally first; a decode
        // failure fails only the sender's connection and never reaches the
        // WAL, so it can't poison a future hydration of this room.
        if self.document.apply_update(&payload).is_err() {
            self.sockets.remove(&peer);
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if self.storage.put(&self.room_id, &update_key(seq), &payload).await.is_err() {
            return;
        }
        if self.storage.put(&self.room_id, SEQ_KEY, &encode_seq(self.next_seq)).await.is_err() {
            return;
        }

        let frame = wire::encode_message(S_UPDATE, &payload);
        for (&id, socket) in &self.sockets {
            if id != peer {
                let _ = socket.tx.send(frame.clone());
            }
        }

        self.dirty = true;
        self.compaction_generation += 1;
        let generation = self.compaction_generation;
        let delay = self.compaction_delay;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::CompactionAlarm { generation }).await;
        });
    }

    fn handle_version_vector(&mut self, peer: PeerId, payload: Vec<u8>) {
        let delta = match bincode::deserialize(&payload) {
            Ok(since) => self.document.delta_since(&since),
            Err(_) => Vec::new(),
        };
        if let Some(socket) = self.sockets.get(&peer) {
            for update in delta {
                let _ = socket.tx.send(wire::encode_message(S_CATCHUP, &update));
            }
        }
    }

    fn handle_awareness(&mut self, peer: PeerId, payload: Vec<u8>) {
        let frame = wire::encode_message(S_AWARENESS, &payload);
        for (&id, socket) in &self.sockets {
            if id != peer {
                let _ = socket.tx.send(frame.clone());
            }
        }
    }

    async fn handle_disconnect(&mut self, peer: PeerId) {
        self.sockets.remove(&peer);
        if self.sockets.is_empty() && self.dirty {
            if Self::compact_into(&self.room_id, &self.storage, &mut self.document).await.is_ok() {
                self.dirty = false;
            }
        }
    }

    fn handle_snapshot(&self, at: Option<Frontier>) -> StudioResult<Vec<u8>> {
        match at {
            Some(frontier) => self.document.fork_at(&frontier).export_snapshot(),
            None => self.document.export_snapshot(),
        }
    }

    async fn handle_alarm(&mut self, generation: u64) {
        if generation != self.compaction_generation || !self.dirty {
            return;
        }
        if Self::compact_into(&self.room_id, &self.storage, &mut self.document).await.is_ok() {
            self.dirty = false;
        }
    }
}

fn encode_seq(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

fn decode_seq(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    let n = bytes.len().min(8);
    arr[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(arr)
}

/// Registry of live room actors, spawning one lazily per first access.
#[derive(Clone)]
pub struct RoomRegistry {
    storage: Storage,
    rooms: Arc<Mutex<HashMap<RoomId, RoomHandle>>>,
    compaction_delay: Duration,
}

impl RoomRegistry {
    pub fn new(storage: Storage) -> Self {
        Self::with_compaction_delay(storage, Duration::from_secs(5))
    }

    pub fn with_compaction_delay(storage: Storage, compaction_delay: Duration) -> Self {
        RoomRegistry { storage, rooms: Arc::new(Mutex::new(HashMap::new())), compaction_delay }
    }

    /// Get or spawn the actor for `room_id`, hydrating it on first access.
    pub async fn ensure_room(&self, room_id: &RoomId) -> StudioResult<RoomHandle> {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            return Ok(handle.clone());
        }

        let (document, next_seq) = Actor::hydrate(room_id, &self.storage).await?;
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            room_id: room_id.clone(),
            storage: self.storage.clone(),
            document,
            next_seq,
            sockets: HashMap::new(),
            dirty: false,
            compaction_generation: 0,
            compaction_delay: self.compaction_delay,
            self_tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));

        let handle = RoomHandle { tx };
        rooms.insert(room_id.clone(), handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csg::{Node, NodeKind, SizeSpec};
    use crate::patcher;

    fn cube(id: &str) -> Node {
        Node::new(id, NodeKind::Cube { size: SizeSpec::Uniform(1.0), center: true })
    }

    #[tokio::test]
    async fn connect_assigns_a_peer_id_frame_first() {
        let storage = Storage::connect_in_memory().await.unwrap();
        let registry = RoomRegistry::new(storage);
        let room = "room-1".to_string();
        let handle = registry.ensure_room(&room).await.unwrap();
        let (peer_id, mut rx) = handle.connect().await;
        let first = rx.recv().await.unwrap();
        let frame = wire::decode_message(&first).unwrap();
        assert_eq!(frame.tag, S_PEER_ID);
        assert_eq!(wire::decode_peer_id(&frame.payload).unwrap(), peer_id);
    }

    #[tokio::test]
    async fn malformed_update_fails_only_the_sender_and_never_touches_the_wal() {
        let storage = Storage::connect_in_memory().await.unwrap();
        let registry = RoomRegistry::new(storage.clone());
        let room = "room-1".to_string();
        let handle = registry.ensure_room(&room).await.unwrap();

        let (peer_a, mut rx_a) = handle.connect().await;
        rx_a.recv().await.unwrap(); // S_PEER_ID
        let (peer_b, mut rx_b) = handle.connect().await;
        rx_b.recv().await.unwrap(); // S_PEER_ID
        let (_peer_c, mut rx_c) = handle.connect().await;
        rx_c.recv().await.unwrap(); // S_PEER_ID

        handle.update(peer_a, vec![0xff, 0x13, 0x37, 0x00]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing durable was written for the undecodable payload.
        let wal = storage.list_prefix(&room, "update:").await.unwrap();
        assert!(wal.iter().all(|(k, _)| k.as_str() == SEQ_KEY));

        // A well-formed update from another peer still broadcasts normally...
        let mut doc = Document::new();
        let ops = patcher::diff(&Node::new("root", NodeKind::Group { children: vec![] }), &Node::new("root", NodeKind::Group { children: vec![cube("a")] }));
        let update = doc.commit_local(peer_b, ops, chrono::Utc::now()).unwrap();
        handle.update(peer_b, update).await;

        // ...and reaches the peer that stayed connected...
        let relayed = wire::decode_message(&rx_c.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.tag, S_UPDATE);

        // ...but never the peer whose malformed update failed its connection.
        assert!(rx_a.try_recv().is_err(), "the offending connection should have been dropped from the room");

        // The room still hydrates cleanly afterwards: no bad WAL entry to choke on.
        let registry2 = RoomRegistry::new(storage);
        registry2.ensure_room(&room).await.unwrap();
    }

    #[tokio::test]
    async fn update_is_persisted_and_broadcast_but_not_echoed() {
        let storage = Storage::connect_in_memory().await.unwrap();
        let registry = RoomRegistry::new(storage.clone());
        let room = "room-1".to_string();
        let handle = registry.ensure_room(&room).await.unwrap();

        let (peer_a, mut rx_a) = handle.connect().await;
        rx_a.recv().await.unwrap(); // S_PEER_ID
        let (_peer_b, mut rx_b) = handle.connect().await;
        rx_b.recv().await.unwrap(); // S_PEER_ID

        let mut doc = Document::new();
        let ops = patcher::diff(&Node::new("root", NodeKind::Group { children: vec![] }), &Node::new("root", NodeKind::Group { children: vec![cube("a")] }));
        let update = doc.commit_local(peer_a, ops, chrono::Utc::now()).unwrap();

        handle.update(peer_a, update).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx_a.try_recv().is_err(), "sender should not receive its own update back");
        let relayed = rx_b.recv().await.unwrap();
        assert_eq!(wire::decode_message(&relayed).unwrap().tag, S_UPDATE);

        let wal = storage.list_prefix(&room, "update:").await.unwrap();
        assert_eq!(wal.iter().filter(|(k, _)| k.as_str() != SEQ_KEY).count(), 1);
    }
}
