//! WebSocket sync server with connection-gated document access.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Registry ── DocActor (doc_id) ── Yrs Doc ── BroadcastGroup
//! Client B ──┘                      │
//!                                   ├── PersistenceBridge
//!                                   │        │
//!                                   │        └── VersionStore (RocksDB)
//!                                   │
//!                        ┌──────────┼───────────┐
//!                        ▼          ▼           ▼
//!                     Client A   Client B    Client C
//! ```
//!
//! Every connection must open with a Hello frame carrying a credential;
//! the server verifies it against the authorization service before the
//! connection can touch a document. Authenticated connections route all
//! document traffic through the registry's per-document actors; a
//! background task flushes dirty documents on an interval.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{AccessGrant, Authorizer};
use crate::persistence::PersistenceBridge;
use crate::presence::AwarenessUpdate;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::registry::Registry;
use crate::store::{StoreConfig, StoreError, VersionStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Seconds between dirty-document flushes
    pub flush_interval_secs: u64,
    /// Seconds an empty document stays live before eviction
    pub idle_grace_secs: u64,
    /// Persistence storage path
    pub storage_path: PathBuf,
    /// Token authenticating service-side restore frames; empty disables them
    pub service_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            flush_interval_secs: 30,
            idle_grace_secs: 30,
            storage_path: PathBuf::from("graphmind_data"),
            service_token: String::new(),
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
    pub rejected_handshakes: u64,
    pub rejected_updates: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    bridge: Arc<PersistenceBridge>,
    store: Arc<VersionStore>,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open storage and build the server. Fails when the store cannot be
    /// opened; a sync server without durability is not allowed to start.
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self, StoreError> {
        let store_config = StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        };
        let store = Arc::new(VersionStore::open(store_config)?);
        let bridge = Arc::new(PersistenceBridge::new(Arc::clone(&store)));
        let registry = Arc::new(Registry::new(
            Arc::clone(&bridge),
            config.broadcast_capacity,
            Duration::from_secs(config.idle_grace_secs),
        ));

        Ok(Self {
            config,
            registry,
            bridge,
            store,
            authorizer,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop and the interval flush task. Call from an
    /// async runtime; never returns under normal operation.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        // Interval flush of dirty documents
        let flush_registry = Arc::clone(&self.registry);
        let flush_interval = Duration::from_secs(self.config.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let flushed = flush_registry.flush_dirty().await;
                if flushed > 0 {
                    log::debug!("Interval flush wrote {flushed} documents");
                }
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let registry = Arc::clone(&self.registry);
            let bridge = Arc::clone(&self.bridge);
            let authorizer = Arc::clone(&self.authorizer);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, config, registry, bridge, authorizer, stats)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<Registry>,
        bridge: Arc<PersistenceBridge>,
        authorizer: Arc<dyn Authorizer>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection; everything stays None until the
        // handshake succeeds.
        let mut session: Option<(PeerInfo, AccessGrant, Uuid)> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        // The session loop runs in its own block so the cleanup below always
        // runs; a failed send to a dead socket must still detach the peer.
        let loop_result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match (sync_msg.msg_type, &session) {
                                    (MessageType::Hello, None) => {
                                        let hello = match sync_msg.hello_payload() {
                                            Ok(h) => h,
                                            Err(e) => {
                                                log::warn!("Bad handshake from {addr}: {e}");
                                                break;
                                            }
                                        };

                                        let grant = match authorizer
                                            .verify_access(sync_msg.doc_id, &hello.credential)
                                            .await
                                        {
                                            Ok(grant) => grant,
                                            Err(e) => {
                                                log::warn!(
                                                    "Handshake rejected for doc {} from {addr}: {e}",
                                                    sync_msg.doc_id
                                                );
                                                stats.write().await.rejected_handshakes += 1;
                                                let reject = SyncMessage::update_rejected(
                                                    sync_msg.peer_id,
                                                    sync_msg.doc_id,
                                                    "access denied",
                                                );
                                                let _ = ws_sender
                                                    .send(Message::Binary(reject.encode()?.into()))
                                                    .await;
                                                let _ = ws_sender.send(Message::Close(None)).await;
                                                break;
                                            }
                                        };

                                        let info = PeerInfo::with_id(sync_msg.peer_id, hello.display_name);
                                        let reply = registry.attach(sync_msg.doc_id, info.clone()).await?;

                                        // Full state first, then the existing roster.
                                        let state_msg = SyncMessage::sync_step2(
                                            Uuid::nil(),
                                            sync_msg.doc_id,
                                            reply.state,
                                        );
                                        ws_sender
                                            .send(Message::Binary(state_msg.encode()?.into()))
                                            .await?;
                                        for peer in &reply.peers {
                                            let joined = SyncMessage::peer_joined(
                                                peer.peer_id,
                                                sync_msg.doc_id,
                                                peer,
                                            );
                                            ws_sender
                                                .send(Message::Binary(joined.encode()?.into()))
                                                .await?;
                                        }

                                        // Announce the newcomer to everyone else.
                                        let join_msg = SyncMessage::peer_joined(
                                            info.peer_id,
                                            sync_msg.doc_id,
                                            &info,
                                        );
                                        registry
                                            .broadcast(sync_msg.doc_id, Arc::new(join_msg.encode()?))
                                            .await;

                                        log::info!(
                                            "Peer {} ({}, {}) joined doc {}",
                                            info.name,
                                            info.peer_id,
                                            grant.role,
                                            sync_msg.doc_id
                                        );

                                        broadcast_rx = Some(reply.rx);
                                        session = Some((info, grant, sync_msg.doc_id));
                                    }

                                    (MessageType::Hello, Some(_)) => {
                                        log::warn!("Duplicate handshake from {addr}; ignoring");
                                    }

                                    (MessageType::ServiceRestore, None) => {
                                        let payload = match sync_msg.service_restore_payload() {
                                            Ok(p) => p,
                                            Err(e) => {
                                                log::warn!("Bad service frame from {addr}: {e}");
                                                break;
                                            }
                                        };
                                        if config.service_token.is_empty()
                                            || payload.service_token != config.service_token
                                        {
                                            log::warn!("Service restore with bad token from {addr}");
                                            stats.write().await.rejected_handshakes += 1;
                                            let reject = SyncMessage::update_rejected(
                                                Uuid::nil(),
                                                sync_msg.doc_id,
                                                "service token rejected",
                                            );
                                            let _ = ws_sender
                                                .send(Message::Binary(reject.encode()?.into()))
                                                .await;
                                            let _ = ws_sender.send(Message::Close(None)).await;
                                            break;
                                        }

                                        // The caller needs the verdict; a bare
                                        // send is indistinguishable from a drop.
                                        let ack = match registry
                                            .replace_state(sync_msg.doc_id, payload.state)
                                            .await
                                        {
                                            Ok(live) => {
                                                log::info!(
                                                    "Service restore for {}: live={live}",
                                                    sync_msg.doc_id
                                                );
                                                SyncMessage::restore_ack(sync_msg.doc_id, true, live, "")
                                            }
                                            Err(e) => {
                                                log::error!(
                                                    "Service restore for {} rejected: {e}",
                                                    sync_msg.doc_id
                                                );
                                                SyncMessage::restore_ack(
                                                    sync_msg.doc_id,
                                                    false,
                                                    false,
                                                    e.to_string(),
                                                )
                                            }
                                        };
                                        let _ = ws_sender
                                            .send(Message::Binary(ack.encode()?.into()))
                                            .await;
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        break;
                                    }

                                    (MessageType::Update, Some((info, grant, doc_id))) => {
                                        let result = registry
                                            .apply_update(
                                                *doc_id,
                                                info.peer_id,
                                                grant.role,
                                                sync_msg.payload,
                                                sync_msg.clock,
                                            )
                                            .await?;
                                        if let Err(rejection) = result {
                                            // Reject to the origin only; nobody
                                            // else saw the update.
                                            stats.write().await.rejected_updates += 1;
                                            let reject = SyncMessage::update_rejected(
                                                info.peer_id,
                                                *doc_id,
                                                rejection.to_string(),
                                            );
                                            ws_sender
                                                .send(Message::Binary(reject.encode()?.into()))
                                                .await?;
                                        }
                                    }

                                    (MessageType::SyncStep1, Some((_, _, doc_id))) => {
                                        match registry.diff(*doc_id, sync_msg.payload).await? {
                                            Ok(diff) => {
                                                let response =
                                                    SyncMessage::sync_step2(Uuid::nil(), *doc_id, diff);
                                                ws_sender
                                                    .send(Message::Binary(response.encode()?.into()))
                                                    .await?;
                                            }
                                            Err(e) => {
                                                log::warn!("Bad state vector from {addr}: {e}");
                                            }
                                        }
                                    }

                                    (MessageType::Awareness, Some((info, _, doc_id))) => {
                                        // Ephemeral: relay to the document's peers,
                                        // never persist.
                                        if AwarenessUpdate::decode(&sync_msg.payload).is_err() {
                                            log::warn!("Undecodable awareness from {addr}; dropping");
                                            continue;
                                        }
                                        let relay = SyncMessage::awareness(
                                            info.peer_id,
                                            *doc_id,
                                            sync_msg.clock,
                                            sync_msg.payload,
                                        );
                                        registry.broadcast(*doc_id, Arc::new(relay.encode()?)).await;
                                    }

                                    (MessageType::ManualSave, Some((info, grant, doc_id))) => {
                                        if !grant.role.can_edit() {
                                            stats.write().await.rejected_updates += 1;
                                            let reject = SyncMessage::update_rejected(
                                                info.peer_id,
                                                *doc_id,
                                                "read-only access: saves are not permitted",
                                            );
                                            ws_sender
                                                .send(Message::Binary(reject.encode()?.into()))
                                                .await?;
                                            continue;
                                        }
                                        let label = sync_msg
                                            .manual_save_payload()
                                            .map(|p| p.label)
                                            .unwrap_or(None);
                                        let Some(state) = registry.encode_state(*doc_id).await else {
                                            continue;
                                        };
                                        let clients = registry.conn_count(*doc_id).await as u32;
                                        match bridge.save_manual(
                                            *doc_id,
                                            &state,
                                            &grant.user_id.to_string(),
                                            label,
                                            clients,
                                        ) {
                                            Ok(version_id) => log::info!(
                                                "Manual save of {} -> version {}",
                                                doc_id,
                                                version_id
                                            ),
                                            Err(e) => {
                                                log::error!("Manual save of {} failed: {e}", doc_id)
                                            }
                                        }
                                    }

                                    (MessageType::Ping, Some((info, _, _))) => {
                                        let pong = SyncMessage::pong(info.peer_id);
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    (_, None) => {
                                        // Anything before a successful handshake
                                        // is refused and the connection dropped.
                                        log::warn!(
                                            "{:?} from {addr} before handshake; closing",
                                            sync_msg.msg_type
                                        );
                                        stats.write().await.rejected_handshakes += 1;
                                        let reject = SyncMessage::update_rejected(
                                            sync_msg.peer_id,
                                            sync_msg.doc_id,
                                            "handshake required",
                                        );
                                        let _ = ws_sender
                                            .send(Message::Binary(reject.encode()?.into()))
                                            .await;
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        break;
                                    }

                                    (other, Some(_)) => {
                                        log::debug!("Unhandled message type: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
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

                    // Outgoing broadcast message
                    msg = async {
                        if let Some(ref mut rx) = broadcast_rx {
                            rx.recv().await
                        } else {
                            // No subscription until the handshake completes
                            std::future::pending().await
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                // Don't echo back to sender
                                if let Ok(frame) = SyncMessage::decode(&data) {
                                    if let Some((info, _, _)) = &session {
                                        if frame.peer_id == info.peer_id
                                            && frame.msg_type != MessageType::StateReplaced
                                        {
                                            continue;
                                        }
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                // Frames were dropped for this connection; push a
                                // full state so it converges without waiting for
                                // the client to notice and request a diff.
                                log::warn!("Connection from {addr} lagged by {n} messages; resyncing");
                                if let Some((_, _, doc_id)) = &session {
                                    if let Some(state) = registry.encode_state(*doc_id).await {
                                        let resync =
                                            SyncMessage::sync_step2(Uuid::nil(), *doc_id, state);
                                        ws_sender
                                            .send(Message::Binary(resync.encode()?.into()))
                                            .await?;
                                    }
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: announce departure, drop presence, detach from the doc.
        if let Some((info, grant, doc_id)) = session {
            let leave = SyncMessage::peer_left(info.peer_id, doc_id);
            if let Ok(encoded) = leave.encode() {
                registry.broadcast(doc_id, Arc::new(encoded)).await;
            }

            // Presence deletion wins over any frame still in flight.
            let gone = AwarenessUpdate::gone(grant.user_id, u64::MAX);
            if let Ok(payload) = gone.encode() {
                let frame = SyncMessage::awareness(info.peer_id, doc_id, 0, payload);
                if let Ok(encoded) = frame.encode() {
                    registry.broadcast(doc_id, Arc::new(encoded)).await;
                }
            }

            registry.detach(doc_id, info.peer_id).await;
            log::info!("Peer {} detached from doc {}", info.peer_id, doc_id);
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        loop_result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the live document registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get the version store.
    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// Get the persistence bridge.
    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        &self.bridge
    }
}
