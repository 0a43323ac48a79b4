//! Fan-out of encoded envelopes to every connected participant.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers.
//! Each frame carries the id of the peer it came from; connection tasks
//! drop frames whose origin is their own peer, which is what turns the
//! fan-out into "everyone but the sender". Server-originated frames carry
//! the nil id and reach everyone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::coordinator::Outbox;
use crate::protocol::Envelope;

/// An encoded envelope plus the peer it must not be echoed to.
#[derive(Debug)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Whether the connection of `peer_id` should forward this frame.
    pub fn is_for(&self, peer_id: Uuid) -> bool {
        self.origin != peer_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub encode_failures: u64,
    pub active_peers: usize,
}

/// The broadcast group for the shared grid.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    /// Connected peers
    peers: RwLock<HashSet<Uuid>>,
    messages_sent: AtomicU64,
    encode_failures: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many frames can be buffered per peer
    /// before a slow peer starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Frame>> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    /// Remove a peer. Returns whether it was registered.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `envelope` and publish it, tagged with `origin`.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn publish(&self, origin: Uuid, envelope: &Envelope) -> usize {
        match envelope.encode() {
            Ok(bytes) => {
                let count = self.sender.send(Arc::new(Frame { origin, bytes })).unwrap_or(0);
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(e) => {
                self.encode_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to encode {} for broadcast: {e}", envelope.intent.name());
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

impl Outbox for BroadcastGroup {
    fn relay(&self, envelope: &Envelope) {
        self.publish(envelope.origin, envelope);
    }

    fn broadcast_all(&self, envelope: &Envelope) {
        self.publish(Uuid::nil(), envelope);
    }
}
