//! WebSocket server hosting the shared tile map.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                  ┌──► Client A (snapshots only)
//!             ├── Mutex<Coordinator> ── BroadcastGroup ──┼──► Client B
//! Client B ──┘        │                         └──► Client C
//!                     │ take_dirty() on disconnect / shutdown
//!                     ▼
//!                 Persister ── PersistenceGateway (GridStore | MemoryStore)
//! ```
//!
//! Every inbound intent is handled start-to-finish under the coordinator
//! lock, and relays are published to the broadcast channel while the lock
//! is held. Each connection task forwards every broadcast frame except the
//! ones its own peer originated.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{Row, TileGrid};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::coordinator::Coordinator;
use crate::protocol::{Envelope, Intent};
use crate::storage::{
    GridStore, MemoryStore, PersistConfig, PersistReport, PersistenceGateway, Persister,
    StoreConfig, StoreError,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity (frames buffered per connection)
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Save retry policy
    pub persist: PersistConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8001".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            persist: PersistConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub relayed_messages: u64,
    pub snapshots_sent: u64,
    pub reseeds: u64,
    pub persisted_snapshots: u64,
    pub persist_failures: u64,
    /// Fan-out counters
    pub broadcast: BroadcastStats,
}

/// State shared by every connection task.
struct Shared {
    coordinator: Mutex<Coordinator>,
    broadcast: BroadcastGroup,
    persister: Persister,
    stats: RwLock<ServerStats>,
}

/// The tile map server.
pub struct TileServer {
    config: ServerConfig,
    shared: Arc<Shared>,
}

impl TileServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    ///
    /// The grid is loaded before this returns, so the server is ready the
    /// moment it starts accepting. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let gateway: Arc<dyn PersistenceGateway> = match &config.storage_path {
            Some(path) => {
                let store = GridStore::open(StoreConfig::at(path.clone()))?;
                log::info!("Opened grid store at {}", store.path().display());
                Arc::new(store)
            }
            None => {
                log::info!("No storage path configured, grid is kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_gateway(config, gateway))
    }

    /// Create a server on top of an existing gateway.
    pub fn with_gateway(config: ServerConfig, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let coordinator = Coordinator::load(gateway.as_ref());
        let persister = Persister::spawn(gateway, config.persist.clone());

        let shared = Arc::new(Shared {
            coordinator: Mutex::new(coordinator),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            persister,
            stats: RwLock::new(ServerStats::default()),
        });

        Self { config, shared }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_gateway(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Serve until the process is killed.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves, then save the grid if it is dirty
    /// and wait for the persister to drain.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Tile server listening on {}", self.config.bind_addr);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Final save and persister drain.
    async fn shutdown(&self) {
        let dirty = self.shared.coordinator.lock().await.take_dirty();
        if let Some(rows) = dirty {
            let report = self.shared.persister.submit(rows).await;
            Self::record_report(&self.shared, report.ok()).await;
        }
        self.shared.persister.shutdown().await;
        log::info!("Tile server stopped");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let peer_id = Uuid::new_v4();

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Subscribe under the coordinator lock so no relay falls between
        // the snapshot and the first frame on the receiver.
        let (mut broadcast_rx, snapshot) = {
            let coordinator = shared.coordinator.lock().await;
            let rx = shared.broadcast.add_peer(peer_id).await;
            (rx, coordinator.snapshot())
        };
        log::info!("Participant {peer_id} joined from {addr}");

        let result = match Self::send(&mut ws_sender, &snapshot).await {
            Ok(()) => {
                shared.stats.write().await.snapshots_sent += 1;
                Self::session(
                    peer_id,
                    addr,
                    &shared,
                    &mut ws_sender,
                    &mut ws_receiver,
                    &mut broadcast_rx,
                )
                .await
            }
            Err(e) => Err(e),
        };

        // Cleanup runs whether or not the session ended cleanly
        shared.broadcast.remove_peer(&peer_id).await;
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Participant {peer_id} left ({addr})");

        let dirty = shared.coordinator.lock().await.take_dirty();
        if let Some(rows) = dirty {
            Self::persist(shared.clone(), rows);
        }

        result
    }

    /// Pump messages until the socket closes.
    async fn session(
        peer_id: Uuid,
        addr: SocketAddr,
        shared: &Arc<Shared>,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        broadcast_rx: &mut broadcast::Receiver<Arc<Frame>>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = shared.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match Envelope::decode(&bytes) {
                                Ok(envelope) => match envelope.intent {
                                    Intent::Ping => {
                                        Self::send(ws_sender, &Envelope::pong(Uuid::nil())).await?;
                                    }
                                    Intent::Pong => {}
                                    _ => Self::dispatch(peer_id, envelope, shared).await,
                                },
                                Err(e) => {
                                    log::warn!("Dropping undecodable frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.is_for(peer_id) {
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // Missed relays cannot be replayed; resync with a snapshot
                            log::warn!("Participant {peer_id} lagged by {n} frames, resending snapshot");
                            let snapshot = Self::resync(shared, broadcast_rx).await;
                            Self::send(ws_sender, &snapshot).await?;
                            shared.stats.write().await.snapshots_sent += 1;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Take a fresh snapshot and restart `broadcast_rx` at the channel tail.
    ///
    /// Frames still queued for the receiver are already part of the
    /// snapshot; both happen under the coordinator lock so none is lost
    /// or delivered twice.
    async fn resync(shared: &Shared, broadcast_rx: &mut broadcast::Receiver<Arc<Frame>>) -> Envelope {
        let coordinator = shared.coordinator.lock().await;
        *broadcast_rx = broadcast_rx.resubscribe();
        coordinator.snapshot()
    }

    /// Run one intent through the coordinator.
    async fn dispatch(peer_id: Uuid, envelope: Envelope, shared: &Arc<Shared>) {
        let dispatch = {
            let mut coordinator = shared.coordinator.lock().await;
            coordinator.handle(peer_id, envelope, &shared.broadcast)
        };

        if dispatch.relayed || dispatch.reseeded {
            let mut s = shared.stats.write().await;
            if dispatch.relayed {
                s.relayed_messages += 1;
            }
            if dispatch.reseeded {
                s.reseeds += 1;
                s.snapshots_sent += 1;
            }
        }
    }

    /// Queue a save and watch its outcome in the background.
    fn persist(shared: Arc<Shared>, rows: Vec<Row>) {
        let reply = shared.persister.submit(rows);
        tokio::spawn(async move {
            let report = reply.await.ok();
            Self::record_report(&shared, report).await;
        });
    }

    /// Count a save outcome; a lost save marks the grid dirty again.
    async fn record_report(shared: &Shared, report: Option<PersistReport>) {
        match report {
            Some(PersistReport::Saved { .. }) => {
                shared.stats.write().await.persisted_snapshots += 1;
            }
            Some(PersistReport::Failed { .. }) | None => {
                shared.stats.write().await.persist_failures += 1;
                shared.coordinator.lock().await.mark_dirty();
            }
        }
    }

    async fn send(ws_sender: &mut WsSink, envelope: &Envelope) -> Result<(), BoxError> {
        let encoded = envelope.encode()?;
        ws_sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.broadcast = self.shared.broadcast.stats().await;
        stats
    }

    /// Copy of the authoritative grid.
    pub async fn grid(&self) -> TileGrid {
        self.shared.coordinator.lock().await.grid().clone()
    }

    /// Whether the grid has edits not yet handed to the persister.
    pub async fn is_dirty(&self) -> bool {
        self.shared.coordinator.lock().await.is_changed()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Number of connected participants.
    pub async fn peer_count(&self) -> usize {
        self.shared.broadcast.peer_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GRID_KEY;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8001");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
        assert_eq!(config.persist.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = TileServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8001");
        assert_eq!(server.grid().await, TileGrid::seeded());
        assert!(!server.is_dirty().await);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = TileServer::new(config).unwrap();
        assert_eq!(server.grid().await, TileGrid::seeded());
    }

    #[tokio::test]
    async fn test_server_restores_stored_grid() {
        let mut grid = TileGrid::seeded();
        grid.add_tile(1, 0, 5, 2.0);
        let store = Arc::new(MemoryStore::with_grid(GRID_KEY, grid.clone().into_rows()));

        let server = TileServer::with_gateway(ServerConfig::default(), store);
        assert_eq!(server.grid().await, grid);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = TileServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.relayed_messages, 0);
        assert_eq!(stats.reseeds, 0);
        assert_eq!(stats.persisted_snapshots, 0);
        assert_eq!(stats.persist_failures, 0);
        assert_eq!(server.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_updates_stats() {
        let server = TileServer::with_defaults();
        let peer = Uuid::new_v4();

        let add = Envelope::new(peer, 1, Intent::AddTile { x: 1, y: 0, kind: 2, elevation: 0.5 });
        TileServer::dispatch(peer, add, &server.shared).await;
        let remove = Envelope::new(peer, 2, Intent::RemoveTile { x: 0, y: 0 });
        TileServer::dispatch(peer, remove, &server.shared).await;
        let remove = Envelope::new(peer, 3, Intent::RemoveTile { x: 1, y: 0 });
        TileServer::dispatch(peer, remove, &server.shared).await;

        let stats = server.stats().await;
        assert_eq!(stats.relayed_messages, 3);
        assert_eq!(stats.reseeds, 1);
        // Three relays plus the reseed snapshot
        assert_eq!(stats.broadcast.messages_sent, 4);
        assert_eq!(stats.broadcast.encode_failures, 0);
        assert_eq!(server.grid().await, TileGrid::seeded());
        assert!(server.is_dirty().await);
    }

    #[tokio::test]
    async fn test_resync_skips_frames_in_snapshot() {
        let config = ServerConfig {
            broadcast_capacity: 2,
            ..ServerConfig::default()
        };
        let server = TileServer::with_gateway(config, Arc::new(MemoryStore::new()));
        let watcher = Uuid::new_v4();
        let mut rx = server.shared.broadcast.add_peer(watcher).await;

        let peer = Uuid::new_v4();
        for x in 1..=4 {
            let add = Envelope::new(peer, x as u64, Intent::AddTile { x, y: 0, kind: 2, elevation: 0.5 });
            TileServer::dispatch(peer, add, &server.shared).await;
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(2))));

        let snapshot = TileServer::resync(&server.shared, &mut rx).await;
        let Intent::Snapshot { grid } = snapshot.intent else {
            panic!("expected a snapshot, got {}", snapshot.intent.name());
        };
        assert_eq!(TileGrid::from_rows(grid).unwrap().filled_count(), 5);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(server.stats().await.broadcast.active_peers, 1);
    }

    #[tokio::test]
    async fn test_failed_save_marks_dirty() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_saves(10);
        let config = ServerConfig {
            persist: PersistConfig::for_testing(),
            ..ServerConfig::default()
        };
        let server = TileServer::with_gateway(config, store.clone());

        server.shared.coordinator.lock().await.mark_dirty();
        server.shutdown().await;

        let stats = server.stats().await;
        assert_eq!(stats.persist_failures, 1);
        assert!(server.is_dirty().await);
        assert!(store.stored(GRID_KEY).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_saves_dirty_grid() {
        let store = Arc::new(MemoryStore::new());
        let server = TileServer::with_gateway(ServerConfig::default(), store.clone());

        let peer = Uuid::new_v4();
        let add = Envelope::new(peer, 1, Intent::AddTile { x: 1, y: 0, kind: 2, elevation: 0.5 });
        TileServer::dispatch(peer, add, &server.shared).await;
        server.shutdown().await;

        assert_eq!(server.stats().await.persisted_snapshots, 1);
        assert_eq!(store.stored(GRID_KEY), Some(server.grid().await.into_rows()));
    }
}
