//! Client-side sync manager (§4.5): keeps a local [`Document`] replica
//! synchronized with a room service over an HTTP snapshot fetch followed by
//! a long-lived WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::crdt::Document;
use crate::error::StudioResult;
use crate::types::PeerId;
use crate::wire::{self, C_UPDATE, C_VERSION_VECTOR, S_CATCHUP, S_PEER_ID, S_UPDATE};

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Where to sync from, and which room (§6 "default room id").
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub room_id: String,
}

impl SyncConfig {
    fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{}/rooms/{}/ws", ws_base.trim_end_matches('/'), self.room_id)
    }

    fn snapshot_url(&self) -> String {
        format!("{}/rooms/{}/snapshot", self.base_url.trim_end_matches('/'), self.room_id)
    }
}

/// Drives a local replica against a remote room. Local edits are pushed in
/// via [`SyncManager::local_updates`]; remote state lands in the shared
/// `document` as it arrives.
pub struct SyncManager {
    config: SyncConfig,
    document: Arc<Mutex<Document>>,
    peer_id: Arc<Mutex<Option<PeerId>>>,
    stopped: Arc<AtomicBool>,
    local_updates_tx: mpsc::UnboundedSender<Vec<u8>>,
    local_updates_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, document: Arc<Mutex<Document>>, peer_id: Arc<Mutex<Option<PeerId>>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        SyncManager { config, document, peer_id, stopped: Arc::new(AtomicBool::new(false)), local_updates_tx: tx, local_updates_rx: Some(rx) }
    }

    /// Channel to forward locally-committed update bytes (from
    /// `Document::commit_local`) into the outgoing C_UPDATE stream.
    pub fn local_updates(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.local_updates_tx.clone()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// A shared stop flag, for callers that need to stop the loop after
    /// moving `self` into a spawned task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Run the sync loop until [`stop`](Self::stop) is called. Fetches a
    /// snapshot once (cold start only), then reconnects on every socket
    /// close with a 3-second delay, re-handshaking via the version vector
    /// rather than re-fetching.
    pub async fn run(mut self) -> StudioResult<()> {
        self.cold_start_snapshot().await?;

        let mut rx = self.local_updates_rx.take().expect("run called once");
        while !self.stopped.load(Ordering::SeqCst) {
            if let Err(err) = self.connect_once(&mut rx).await {
                warn!(error = %err, "sync connection dropped");
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
        Ok(())
    }

    async fn cold_start_snapshot(&self) -> StudioResult<()> {
        let client = reqwest::Client::new();
        let response = match client.get(self.config.snapshot_url()).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return Ok(()), // no snapshot yet; start from an empty document
        };
        let bytes = response.bytes().await.map_err(|e| crate::error::StudioError::Transport(e.to_string()))?;
        let imported = Document::import_snapshot(&bytes)?;
        *self.document.lock().await = imported;
        Ok(())
    }

    async fn connect_once(&self, local_updates: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> StudioResult<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.ws_url())
            .await
            .map_err(|e| crate::error::StudioError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let version_vector = self.document.lock().await.version_vector();
        let payload = bincode::serialize(&version_vector).map_err(crate::error::StudioError::Encoding)?;
        sink.send(Message::Binary(wire::encode_message(C_VERSION_VECTOR, &payload)))
            .await
            .map_err(|e| crate::error::StudioError::Transport(e.to_string()))?;

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(bytes))) => self.handle_frame(&bytes).await?,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(err)) => return Err(crate::error::StudioError::Transport(err.to_string())),
                        _ => {}
                    }
                }
                outgoing = local_updates.recv() => {
                    match outgoing {
                        Some(payload) => {
                            let frame = wire::encode_message(C_UPDATE, &payload);
                            sink.send(Message::Binary(frame)).await.map_err(|e| crate::error::StudioError::Transport(e.to_string()))?;
                        }
                        None => return Ok(()),
                    }
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) -> StudioResult<()> {
        let frame = wire::decode_message(bytes)?;
        match frame.tag {
            S_UPDATE | S_CATCHUP => {
                self.document.lock().await.apply_update(&frame.payload)?;
            }
            S_PEER_ID => {
                let id = wire::decode_peer_id(&frame.payload)?;
                *self.peer_id.lock().await = Some(id);
                debug!(peer_id = id, "adopted assigned peer id");
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_url_becomes_ws_url() {
        let config = SyncConfig { base_url: "http://localhost:8787".into(), room_id: "default".into() };
        assert_eq!(config.ws_url(), "ws://localhost:8787/rooms/default/ws");
    }

    #[test]
    fn https_base_url_becomes_wss_url() {
        let config = SyncConfig { base_url: "https://studio.example/api/".into(), room_id: "team-a".into() };
        assert_eq!(config.ws_url(), "wss://studio.example/api/rooms/team-a/ws");
    }

    #[test]
    fn snapshot_url_is_derived_from_base_and_room() {
        let config = SyncConfig { base_url: "http://localhost:8787".into(), room_id: "default".into() };
        assert_eq!(config.snapshot_url(), "http://localhost:8787/rooms/default/snapshot");
    }
}
