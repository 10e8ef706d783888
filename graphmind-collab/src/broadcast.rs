//! Fan-out broadcast to the connections attached to one document.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` messages before lagging receivers start dropping.
//!
//! Origin filtering (not echoing a frame back to its sender) is the
//! connection loop's job; the group delivers to every subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_connections: usize,
}

/// A broadcast group for a single live document.
///
/// All connections attached to the same document share one channel; an
/// update from one connection is fanned out to the N-1 others.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Attached connections, keyed by peer id
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,

    /// Messages buffered per receiver before backpressure drops
    capacity: usize,

    /// Lock-free counter, never touched with a lock held
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection; returns its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    /// Remove a connection.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    /// Broadcast a message to all attached connections.
    ///
    /// Returns the number of receivers that got the message.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_connections: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a peer (server-internal observers).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        group.remove_peer(&peer_id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);

        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");
        let carol = PeerInfo::new("Carol");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(bob).await;
        let mut rx3 = group.add_peer(carol).await;

        let msg = SyncMessage::update(alice.peer_id, Uuid::new_v4(), 1, vec![1, 2, 3]);
        let count = group.broadcast(&msg).unwrap();

        // Includes the sender's receiver; filtering is the caller's job.
        assert_eq!(count, 3);
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
        rx3.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_raw_zero_copy() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(PeerInfo::new("Alice")).await;

        let data = Arc::new(vec![10, 20, 30]);
        assert_eq!(group.broadcast_raw(data.clone()), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(*received, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let _rx = group.add_peer(peer.clone()).await;

        let msg = SyncMessage::ping(peer.peer_id);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(PeerInfo::new("Alice")).await;
        let _rx2 = group.add_peer(PeerInfo::new("Bob")).await;

        let peers = group.peers().await;
        let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(peers.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }

    #[tokio::test]
    async fn test_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
