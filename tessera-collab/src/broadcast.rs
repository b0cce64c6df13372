//! Fan-out of text frames to every connection in a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to `capacity`
//! frames. Frames carry the origin connection so receivers can skip their own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server-side identifier of one WebSocket connection.
pub type ConnectionId = Uuid;

/// A pre-encoded frame queued for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Connection the frame came from. `None` for server-originated frames.
    pub origin: Option<ConnectionId>,
    pub text: String,
}

impl Frame {
    /// Whether `connection` should receive this frame.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated without taking the room lock.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Broadcast group for one room.
///
/// Membership changes take `&mut self`; the server holds the group inside its
/// room map and mutates it under the map's write lock.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    peers: HashSet<ConnectionId>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a receiver may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: HashSet::new(),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register a connection and return its receiver.
    pub fn add_peer(&mut self, connection: ConnectionId) -> broadcast::Receiver<Arc<Frame>> {
        self.peers.insert(connection);
        self.sender.subscribe()
    }

    pub fn remove_peer(&mut self, connection: &ConnectionId) -> bool {
        self.peers.remove(connection)
    }

    pub fn has_peer(&self, connection: &ConnectionId) -> bool {
        self.peers.contains(connection)
    }

    /// Send a frame to every receiver. Returns the number of receivers.
    ///
    /// The sender's own receiver gets the frame too; filtering by
    /// [`Frame::is_for`] is the receiver's job.
    pub fn broadcast(&self, origin: Option<ConnectionId>, text: String) -> usize {
        self.broadcast_frame(Arc::new(Frame { origin, text }))
    }

    /// Send an already shared frame.
    pub fn broadcast_frame(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
