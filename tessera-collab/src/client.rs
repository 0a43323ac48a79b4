//! WebSocket client holding a local replica of the shared grid.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect detection)
//! - Optimistic local edits, sent to the server after they apply
//! - Replica maintenance from snapshots and relayed intents
//! - Offline queue for edits made while disconnected
//!
//! Reference: Kleppmann, Chapter 5: Replication

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{Outcome, TileGrid};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Envelope, Intent, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The replica was replaced by a server snapshot
    SnapshotReceived { rows: usize, filled: usize },
    /// Another participant's intent was applied to the replica
    RemoteIntent {
        origin: Uuid,
        intent: Intent,
        outcome: Outcome,
    },
}

/// Intents made while disconnected, replayed after the next snapshot.
pub struct IntentQueue {
    queue: VecDeque<Intent>,
    max_size: usize,
}

impl IntentQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an intent. Returns false when the queue is full.
    pub fn enqueue(&mut self, intent: Intent) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(intent);
        true
    }

    /// Drain all queued intents in submission order.
    pub fn drain(&mut self) -> Vec<Intent> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// State shared between the client handle and its reader task.
struct Replica {
    grid: RwLock<TileGrid>,
    state: RwLock<ConnectionState>,
    queue: Mutex<IntentQueue>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    seq: AtomicU64,
    /// A snapshot arrived on the current connection
    synced: AtomicBool,
    peer_id: Uuid,
}

impl Replica {
    fn next_envelope(&self, intent: Intent) -> Envelope {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        Envelope::new(self.peer_id, seq, intent)
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let encoded = envelope.encode()?;
        let tx = self.outgoing.read().await.clone();
        match tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Replay intents queued while offline on top of a fresh snapshot.
    async fn replay(&self, queue: &mut IntentQueue) {
        let queued = queue.drain();
        if queued.is_empty() {
            return;
        }
        log::info!("Replaying {} queued intents", queued.len());
        for intent in queued {
            let outcome = {
                let mut grid = self.grid.write().await;
                apply_intent(&mut grid, &intent)
            };
            if !outcome.is_applied() {
                log::debug!("Queued {} no longer applies: {outcome:?}", intent.name());
                continue;
            }
            let envelope = self.next_envelope(intent);
            if let Err(e) = self.send(&envelope).await {
                log::warn!("Failed to replay {}: {e}", envelope.intent.name());
                queue.enqueue(envelope.intent);
            }
        }
    }
}

/// The tile map client.
pub struct TileClient {
    replica: Arc<Replica>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent>,

    /// Server URL
    server_url: String,
}

impl TileClient {
    /// Create a new client. The replica starts as a fresh seed until the
    /// first snapshot arrives.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            replica: Arc::new(Replica {
                grid: RwLock::new(TileGrid::seeded()),
                state: RwLock::new(ConnectionState::Disconnected),
                queue: Mutex::new(IntentQueue::new(10_000)),
                outgoing: RwLock::new(None),
                seq: AtomicU64::new(0),
                synced: AtomicBool::new(false),
                peer_id: Uuid::new_v4(),
            }),
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        *self.replica.state.write().await = ConnectionState::Connecting;
        self.replica.synced.store(false, Ordering::Release);

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.replica.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.replica.outgoing.write().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        *self.replica.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: maintain the replica from incoming messages
        let replica = self.replica.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match Envelope::decode(&bytes) {
                            Ok(envelope) => {
                                if let Some(evt) = Self::apply_remote(&replica, envelope).await {
                                    let _ = event_tx.send(evt).await;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            replica.synced.store(false, Ordering::Release);
            *replica.outgoing.write().await = None;
            *replica.state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Apply a message from the server to the replica.
    async fn apply_remote(replica: &Replica, envelope: Envelope) -> Option<ClientEvent> {
        match envelope.intent {
            Intent::Snapshot { grid } => {
                let restored = match TileGrid::from_rows(grid) {
                    Ok(restored) => restored,
                    Err(e) => {
                        log::warn!("Ignoring unusable snapshot: {e}");
                        return None;
                    }
                };
                let event = ClientEvent::SnapshotReceived {
                    rows: restored.row_count(),
                    filled: restored.filled_count(),
                };
                // Local edits wait on the queue until the replay is done
                let mut queue = replica.queue.lock().await;
                *replica.grid.write().await = restored;
                replica.replay(&mut queue).await;
                replica.synced.store(true, Ordering::Release);
                Some(event)
            }
            Intent::Ping => {
                let _ = replica.send(&Envelope::pong(replica.peer_id)).await;
                None
            }
            Intent::Pong => None,
            intent => {
                let outcome = {
                    let mut grid = replica.grid.write().await;
                    apply_intent(&mut grid, &intent)
                };
                log::debug!("Remote {} from {}: {outcome:?}", intent.name(), envelope.origin);
                Some(ClientEvent::RemoteIntent {
                    origin: envelope.origin,
                    intent,
                    outcome,
                })
            }
        }
    }

    /// Place or repaint a tile.
    pub async fn add_tile(&self, x: i32, y: i32, kind: u32, elevation: f32) -> Result<Outcome, ProtocolError> {
        self.submit(Intent::AddTile { x, y, kind, elevation }).await
    }

    /// Remove a tile.
    pub async fn remove_tile(&self, x: i32, y: i32) -> Result<Outcome, ProtocolError> {
        self.submit(Intent::RemoveTile { x, y }).await
    }

    /// Change kind and elevation of an existing tile.
    pub async fn update_tile(&self, x: i32, y: i32, kind: u32, elevation: f32) -> Result<Outcome, ProtocolError> {
        self.submit(Intent::UpdateTile { x, y, kind, elevation }).await
    }

    /// Apply locally, then send if the edit changed the replica.
    ///
    /// Until the current connection has delivered its snapshot, applied
    /// intents are queued instead. Fails only when the offline queue is full.
    async fn submit(&self, intent: Intent) -> Result<Outcome, ProtocolError> {
        let mut queue = self.replica.queue.lock().await;
        let outcome = {
            let mut grid = self.replica.grid.write().await;
            apply_intent(&mut grid, &intent)
        };
        if !outcome.is_applied() {
            return Ok(outcome);
        }

        if !self.replica.synced.load(Ordering::Acquire) {
            if !queue.enqueue(intent) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(outcome);
        }

        let envelope = self.replica.next_envelope(intent);
        if let Err(e) = self.replica.send(&envelope).await {
            log::debug!("Send failed ({e}), queueing {}", envelope.intent.name());
            if !queue.enqueue(envelope.intent) {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
        Ok(outcome)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.replica.send(&Envelope::ping(self.replica.peer_id)).await
    }

    /// Copy of the local replica.
    pub async fn grid(&self) -> TileGrid {
        self.replica.grid.read().await.clone()
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.replica.state.read().await
    }

    /// Client-side id, used as the envelope origin.
    pub fn peer_id(&self) -> Uuid {
        self.replica.peer_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Number of envelopes sent so far.
    pub fn seq(&self) -> u64 {
        self.replica.seq.load(Ordering::Relaxed)
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.replica.queue.lock().await.len()
    }
}

/// Apply a mutation with the same rules the server uses.
fn apply_intent(grid: &mut TileGrid, intent: &Intent) -> Outcome {
    let outcome = match *intent {
        Intent::AddTile { x, y, kind, elevation } => grid.add_tile(x, y, kind, elevation),
        Intent::RemoveTile { x, y } => grid.remove_tile(x, y),
        Intent::UpdateTile { x, y, kind, elevation } => grid.update_tile(x, y, kind, elevation),
        Intent::Snapshot { .. } | Intent::Ping | Intent::Pong => Outcome::IgnoredInvalid,
    };
    if !grid.has_filled() {
        // The server reseeds and sends a snapshot; mirror it locally
        *grid = TileGrid::seeded();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Cell;

    #[test]
    fn test_client_creation() {
        let client = TileClient::new("ws://localhost:8001");
        assert_eq!(client.server_url(), "ws://localhost:8001");
        assert!(!client.peer_id().is_nil());
        assert_eq!(client.seq(), 0);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = TileClient::new("ws://localhost:8001");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert_eq!(client.grid().await, TileGrid::seeded());
    }

    #[tokio::test]
    async fn test_offline_edit_applies_and_queues() {
        let client = TileClient::new("ws://localhost:8001");

        let outcome = client.add_tile(1, 0, 2, 0.5).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(client.grid().await.get(1, 0).is_some_and(Cell::is_filled));
        assert_eq!(client.offline_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_ignored_edit_not_queued() {
        let client = TileClient::new("ws://localhost:8001");

        assert_eq!(client.add_tile(9, 9, 2, 0.5).await.unwrap(), Outcome::IgnoredInvalid);
        assert_eq!(client.remove_tile(1, 0).await.unwrap(), Outcome::IgnoredInvalid);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = TileClient::new("ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_apply_remote_snapshot_replaces_replica() {
        let client = TileClient::new("ws://localhost:8001");
        let mut grid = TileGrid::seeded();
        grid.add_tile(1, 0, 4, 1.0);

        let event = TileClient::apply_remote(&client.replica, Envelope::snapshot(grid.clone().into_rows())).await;
        assert!(matches!(event, Some(ClientEvent::SnapshotReceived { filled: 2, .. })));
        assert_eq!(client.grid().await, grid);
    }

    #[tokio::test]
    async fn test_apply_remote_intent() {
        let client = TileClient::new("ws://localhost:8001");
        let other = Uuid::new_v4();
        let envelope = Envelope::new(other, 1, Intent::AddTile { x: 0, y: 1, kind: 3, elevation: 0.0 });

        match TileClient::apply_remote(&client.replica, envelope).await {
            Some(ClientEvent::RemoteIntent { origin, outcome, .. }) => {
                assert_eq!(origin, other);
                assert_eq!(outcome, Outcome::Applied);
            }
            other => panic!("Expected RemoteIntent, got {other:?}"),
        }
        assert!(client.grid().await.get(0, 1).is_some_and(Cell::is_filled));
    }

    #[test]
    fn test_apply_intent_reseeds_when_empty() {
        let mut grid = TileGrid::seeded();
        let outcome = apply_intent(&mut grid, &Intent::RemoveTile { x: 0, y: 0 });
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(grid, TileGrid::seeded());
    }

    #[test]
    fn test_intent_queue() {
        let mut queue = IntentQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(Intent::RemoveTile { x: 1, y: 0 });
        queue.enqueue(Intent::AddTile { x: 1, y: 0, kind: 1, elevation: 0.5 });
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained[0], Intent::RemoveTile { x: 1, y: 0 });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_intent_queue_capacity() {
        let mut queue = IntentQueue::new(2);
        assert!(queue.enqueue(Intent::Ping));
        assert!(queue.enqueue(Intent::Ping));
        assert!(!queue.enqueue(Intent::Ping));
        assert_eq!(queue.len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }
}
