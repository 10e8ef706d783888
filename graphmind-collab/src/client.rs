//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle with a credential-gated handshake
//! - Update send/receive with automatic Yrs integration
//! - Awareness (cursor/selection/focus) updates
//! - Manual save requests
//! - Offline queue for disconnected edits

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::presence::AwarenessUpdate;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Handshake accepted, connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Received a CRDT update from a remote peer
    RemoteUpdate {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// Received an awareness update from a remote peer
    RemoteAwareness {
        peer_id: Uuid,
        update: AwarenessUpdate,
    },
    /// A peer joined the document
    PeerJoined(PeerInfo),
    /// A peer left the document
    PeerLeft(Uuid),
    /// Initial state sync received; apply as a regular update
    StateSynced(Vec<u8>),
    /// Server replaced the document wholesale (restore); rebuild the local
    /// doc from this state instead of merging
    StateReplaced(Vec<u8>),
    /// The server refused something we sent (handshake or update)
    Rejected(String),
}

/// Offline queue for edits made while disconnected.
///
/// Queued updates are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|q| (q.clock, q.payload)).collect()
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

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|q| q.payload.len()).sum()
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the collaboration server: handshake,
/// update sync, awareness, manual saves, and offline queueing.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,

    /// Credential presented in the handshake
    credential: String,

    /// Document we're editing
    doc_id: Uuid,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Lamport clock for causal ordering
    clock: Arc<RwLock<u64>>,

    /// Offline queue for disconnected edits
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    /// Server URL
    server_url: String,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(
        display_name: impl Into<String>,
        credential: impl Into<String>,
        doc_id: Uuid,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info: PeerInfo::new(display_name),
            credential: credential.into(),
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and perform the credential handshake.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// server's verdict arrives as an event: [`SyncEvent::StateSynced`] on
    /// success, [`SyncEvent::Rejected`] followed by a disconnect otherwise.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        match ws_result {
            Ok((ws_stream, _)) => {
                let (ws_writer, mut ws_reader) = ws_stream.split();

                // Outgoing message channel
                let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
                self.outgoing_tx = Some(out_tx);

                // Writer task: forward outgoing channel to WebSocket
                let ws_writer = Arc::new(tokio::sync::Mutex::new(ws_writer));
                let writer = ws_writer.clone();
                tokio::spawn(async move {
                    while let Some(data) = out_rx.recv().await {
                        let mut w = writer.lock().await;
                        use futures_util::SinkExt;
                        if w.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                // Handshake must be the first frame.
                let hello = SyncMessage::hello(
                    self.peer_info.peer_id,
                    self.doc_id,
                    self.credential.clone(),
                    self.peer_info.name.clone(),
                );
                if let Some(ref tx) = self.outgoing_tx {
                    tx.send(hello.encode()?)
                        .await
                        .map_err(|_| ProtocolError::ConnectionClosed)?;
                }

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(SyncEvent::Connected).await;

                // Replay offline queue
                {
                    let mut queue = self.offline_queue.lock().await;
                    let queued = queue.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued updates", queued.len());
                        for (clock, payload) in queued {
                            let msg = SyncMessage::update(
                                self.peer_info.peer_id,
                                self.doc_id,
                                clock,
                                payload,
                            );
                            if let Ok(encoded) = msg.encode() {
                                if let Some(ref tx) = self.outgoing_tx {
                                    let _ = tx.send(encoded).await;
                                }
                            }
                        }
                    }
                }

                // Reader task: process incoming WebSocket messages
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                let peer_id = self.peer_info.peer_id;
                tokio::spawn(async move {
                    while let Some(msg) = ws_reader.next().await {
                        match msg {
                            Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                                let bytes: Vec<u8> = data.into();
                                if let Ok(sync_msg) = SyncMessage::decode(&bytes) {
                                    // Skip our own messages, except rejections
                                    // which are addressed to us.
                                    if sync_msg.peer_id == peer_id
                                        && sync_msg.msg_type != MessageType::UpdateRejected
                                    {
                                        continue;
                                    }

                                    let event = match sync_msg.msg_type {
                                        MessageType::Update => Some(SyncEvent::RemoteUpdate {
                                            peer_id: sync_msg.peer_id,
                                            clock: sync_msg.clock,
                                            update: sync_msg.payload,
                                        }),
                                        MessageType::SyncStep2 => {
                                            Some(SyncEvent::StateSynced(sync_msg.payload))
                                        }
                                        MessageType::StateReplaced => {
                                            Some(SyncEvent::StateReplaced(sync_msg.payload))
                                        }
                                        MessageType::UpdateRejected => sync_msg
                                            .rejection()
                                            .ok()
                                            .map(|r| SyncEvent::Rejected(r.reason)),
                                        MessageType::Awareness => {
                                            AwarenessUpdate::decode(&sync_msg.payload).ok().map(
                                                |update| SyncEvent::RemoteAwareness {
                                                    peer_id: sync_msg.peer_id,
                                                    update,
                                                },
                                            )
                                        }
                                        MessageType::PeerJoined => {
                                            sync_msg.peer_info().ok().map(SyncEvent::PeerJoined)
                                        }
                                        MessageType::PeerLeft => {
                                            Some(SyncEvent::PeerLeft(sync_msg.peer_id))
                                        }
                                        _ => None,
                                    };

                                    if let Some(evt) = event {
                                        let _ = event_tx.send(evt).await;
                                    }
                                }
                            }
                            Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                                break;
                            }
                            _ => {}
                        }
                    }

                    // Connection lost
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(SyncEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(_e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Send a CRDT update to the server.
    ///
    /// If disconnected, queues the update for later replay.
    pub async fn send_update(&self, yrs_update: Vec<u8>) -> Result<(), ProtocolError> {
        let mut clock = self.clock.write().await;
        *clock += 1;
        let current_clock = *clock;

        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            // Queue for offline replay
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_clock, yrs_update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::update(self.peer_info.peer_id, self.doc_id, current_clock, yrs_update);
        self.send(msg.encode()?).await
    }

    /// Send an awareness update (cursor position, focus, selection).
    pub async fn send_awareness(&self, update: &AwarenessUpdate) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Ok(()); // Silently drop awareness when offline
        }

        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.peer_info.peer_id, self.doc_id, clock, update.encode()?);
        self.send(msg.encode()?).await
    }

    /// Request a manual durable save with an optional label.
    pub async fn manual_save(&self, label: Option<String>) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let msg = SyncMessage::manual_save(self.peer_info.peer_id, self.doc_id, label);
        self.send(msg.encode()?).await
    }

    /// Request a state diff for everything we are missing.
    pub async fn request_sync(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.peer_info.peer_id, self.doc_id, state_vector);
        self.send(msg.encode()?).await
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.peer_info.peer_id);
        self.send(msg.encode()?).await
    }

    async fn send(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get our peer info.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    /// Get the document ID.
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Get the current Lamport clock value.
    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("TestUser", "token", doc_id, "ws://localhost:9090");

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("TestUser", "token", Uuid::new_v4(), "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("TestUser", "token", Uuid::new_v4(), "ws://localhost:9090");

        // Not connected — update should be queued
        client.send_update(vec![1, 2, 3]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 1);

        client.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);

        // Clock should have incremented
        assert_eq!(client.clock().await, 2);
    }

    #[tokio::test]
    async fn test_send_awareness_offline_noop() {
        let client = SyncClient::new("TestUser", "token", Uuid::new_v4(), "ws://localhost:9090");

        let update = AwarenessUpdate::new(Uuid::new_v4(), 1).with_cursor(1.0, 2.0);
        // Should not error when offline
        client.send_awareness(&update).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_save_offline_fails() {
        let client = SyncClient::new("TestUser", "token", Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.manual_save(None).await.is_err());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, 1); // clock
        assert_eq!(drained[0].1, vec![1, 2, 3]); // payload
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);

        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4])); // Full

        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_offline_queue_clear() {
        let mut queue = OfflineQueue::new(100);
        queue.enqueue(1, vec![1]);
        queue.enqueue(2, vec![2]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("TestUser", "token", Uuid::new_v4(), "ws://localhost:9090");

        // First take should succeed
        assert!(client.take_event_rx().is_some());
        // Second take should return None
        assert!(client.take_event_rx().is_none());
    }
}
