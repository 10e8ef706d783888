//! Live document registry.
//!
//! Every open document is owned by a single actor task holding the CRDT
//! state; all mutations arrive through its mailbox, so merge, dirty
//! tracking and fan-out ordering are serialized per document without
//! locks around the doc itself. The registry creates actors on first
//! attach (hydrating from storage), routes commands, and evicts idle
//! documents after a grace period with a final flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::auth::Role;
use crate::broadcast::BroadcastGroup;
use crate::codec::SnapshotMeta;
use crate::persistence::PersistenceBridge;
use crate::protocol::{PeerInfo, SyncMessage};

const MAILBOX_CAPACITY: usize = 256;

/// Why an update was refused by the merge layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRejection {
    /// The sender's role does not permit writes
    ReadOnly,
    /// The payload is not a decodable CRDT update
    Malformed(String),
}

impl std::fmt::Display for UpdateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "Read-only access: updates are not permitted"),
            Self::Malformed(e) => write!(f, "Malformed update: {e}"),
        }
    }
}

/// Registry errors.
#[derive(Debug)]
pub enum RegistryError {
    /// The document's actor is gone (shut down mid-request)
    DocumentClosed,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentClosed => write!(f, "Document actor closed"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Result of attaching a connection to a document.
pub struct AttachReply {
    /// Full state update for initial sync
    pub state: Vec<u8>,
    /// Fan-out subscription for this connection
    pub rx: tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
    /// Peers already attached (the new peer excluded)
    pub peers: Vec<PeerInfo>,
}

enum DocCommand {
    Attach {
        info: PeerInfo,
        reply: oneshot::Sender<AttachReply>,
    },
    ApplyUpdate {
        origin: Uuid,
        role: Role,
        update: Vec<u8>,
        clock: u64,
        reply: oneshot::Sender<Result<(), UpdateRejection>>,
    },
    /// Diff against a remote state vector
    Diff {
        state_vector: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, UpdateRejection>>,
    },
    EncodeState {
        reply: oneshot::Sender<Vec<u8>>,
    },
    /// Swap in a fully different state and announce it to every peer
    ReplaceState {
        state: Vec<u8>,
        reply: oneshot::Sender<Result<(), UpdateRejection>>,
    },
    /// Drain the dirty flag, returning the full state when it was set
    TakeDirty {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Broadcast(Arc<Vec<u8>>),
    Detach {
        peer_id: Uuid,
    },
    ConnCount {
        reply: oneshot::Sender<usize>,
    },
    /// Stop the actor unless connections are attached; the actor itself
    /// re-checks its peer count so an attach racing the idle grace period
    /// cannot have its actor killed underneath it.
    ShutdownIfIdle {
        reply: oneshot::Sender<IdleVerdict>,
    },
}

/// Actor's answer to [`DocCommand::ShutdownIfIdle`].
enum IdleVerdict {
    /// Connections are attached; the actor keeps running
    Busy,
    /// The actor stopped; carries the final state if it was dirty
    Stopped(Option<Vec<u8>>),
}

/// Actor owning one document's CRDT state.
struct DocActor {
    doc_id: Uuid,
    doc: yrs::Doc,
    group: Arc<BroadcastGroup>,
    clock: u64,
    dirty: bool,
}

impl DocActor {
    fn hydrate(doc_id: Uuid, state: &[u8], group: Arc<BroadcastGroup>) -> Self {
        let doc = yrs::Doc::new();
        if !state.is_empty() {
            match Update::decode_v1(state) {
                Ok(update) => {
                    let mut txn = doc.transact_mut();
                    if let Err(e) = txn.apply_update(update) {
                        log::error!("Failed to hydrate {}: {}; starting empty", doc_id, e);
                    }
                }
                Err(e) => log::error!("Undecodable stored state for {}: {}; starting empty", doc_id, e),
            }
        }
        Self {
            doc_id,
            doc,
            group,
            clock: 0,
            dirty: false,
        }
    }

    fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                DocCommand::Attach { info, reply } => {
                    let peers = self.group.peers().await;
                    let sub = self.group.add_peer(info).await;
                    let _ = reply.send(AttachReply {
                        state: self.encode_state(),
                        rx: sub,
                        peers,
                    });
                }
                DocCommand::ApplyUpdate {
                    origin,
                    role,
                    update,
                    clock,
                    reply,
                } => {
                    let result = self.apply(origin, role, update, clock);
                    let _ = reply.send(result);
                }
                DocCommand::Diff {
                    state_vector,
                    reply,
                } => {
                    let result = StateVector::decode_v1(&state_vector)
                        .map(|sv| self.doc.transact().encode_diff_v1(&sv))
                        .map_err(|e| UpdateRejection::Malformed(e.to_string()));
                    let _ = reply.send(result);
                }
                DocCommand::EncodeState { reply } => {
                    let _ = reply.send(self.encode_state());
                }
                DocCommand::ReplaceState { state, reply } => {
                    let _ = reply.send(self.replace(state));
                }
                DocCommand::TakeDirty { reply } => {
                    let state = if self.dirty {
                        self.dirty = false;
                        Some(self.encode_state())
                    } else {
                        None
                    };
                    let _ = reply.send(state);
                }
                DocCommand::Broadcast(encoded) => {
                    self.group.broadcast_raw(encoded);
                }
                DocCommand::Detach { peer_id } => {
                    self.group.remove_peer(&peer_id).await;
                }
                DocCommand::ConnCount { reply } => {
                    let _ = reply.send(self.group.peer_count().await);
                }
                DocCommand::ShutdownIfIdle { reply } => {
                    if self.group.peer_count().await > 0 {
                        let _ = reply.send(IdleVerdict::Busy);
                        continue;
                    }
                    let state = if self.dirty {
                        self.dirty = false;
                        Some(self.encode_state())
                    } else {
                        None
                    };
                    let _ = reply.send(IdleVerdict::Stopped(state));
                    break;
                }
            }
        }
        log::debug!("Document actor {} stopped", self.doc_id);
    }

    fn apply(
        &mut self,
        origin: Uuid,
        role: Role,
        update: Vec<u8>,
        clock: u64,
    ) -> Result<(), UpdateRejection> {
        if !role.can_edit() {
            return Err(UpdateRejection::ReadOnly);
        }

        let decoded =
            Update::decode_v1(&update).map_err(|e| UpdateRejection::Malformed(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| UpdateRejection::Malformed(e.to_string()))?;
        }

        self.clock = self.clock.max(clock) + 1;
        self.dirty = true;

        // Fan-out happens inside the actor so every peer observes updates
        // in application order.
        let msg = SyncMessage::update(origin, self.doc_id, self.clock, update);
        if let Err(e) = self.group.broadcast(&msg) {
            log::warn!("Broadcast failure on {}: {}", self.doc_id, e);
        }
        Ok(())
    }

    fn replace(&mut self, state: Vec<u8>) -> Result<(), UpdateRejection> {
        let update =
            Update::decode_v1(&state).map_err(|e| UpdateRejection::Malformed(e.to_string()))?;

        // Merging an older state into the live doc would be a CRDT no-op,
        // so restore swaps in a fresh doc and tells peers to rebuild.
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| UpdateRejection::Malformed(e.to_string()))?;
        }
        self.doc = doc;
        self.clock += 1;
        // The replacement is already durable; don't re-flush it.
        self.dirty = false;

        let msg = SyncMessage::state_replaced(self.doc_id, state);
        if let Err(e) = self.group.broadcast(&msg) {
            log::warn!("StateReplaced broadcast failure on {}: {}", self.doc_id, e);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct DocHandle {
    tx: mpsc::Sender<DocCommand>,
}

impl DocHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DocCommand,
    ) -> Result<T, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RegistryError::DocumentClosed)?;
        reply_rx.await.map_err(|_| RegistryError::DocumentClosed)
    }
}

/// Routes commands to per-document actors, creating and evicting them.
pub struct Registry {
    docs: Arc<RwLock<HashMap<Uuid, DocHandle>>>,
    bridge: Arc<PersistenceBridge>,
    broadcast_capacity: usize,
    idle_grace: Duration,
}

impl Registry {
    pub fn new(bridge: Arc<PersistenceBridge>, broadcast_capacity: usize, idle_grace: Duration) -> Self {
        Self {
            docs: Arc::new(RwLock::new(HashMap::new())),
            bridge,
            broadcast_capacity,
            idle_grace,
        }
    }

    /// Attach a connection, spawning and hydrating the document's actor if
    /// it is not live yet.
    pub async fn attach(&self, doc_id: Uuid, info: PeerInfo) -> Result<AttachReply, RegistryError> {
        // A handle can go stale when the actor evicts between lookup and
        // send; retry against a fresh (re-spawned) actor.
        for _ in 0..3 {
            let handle = self.handle_or_spawn(doc_id).await;
            let info = info.clone();
            match handle.request(|reply| DocCommand::Attach { info, reply }).await {
                Ok(reply) => return Ok(reply),
                Err(RegistryError::DocumentClosed) => continue,
            }
        }
        Err(RegistryError::DocumentClosed)
    }

    pub async fn apply_update(
        &self,
        doc_id: Uuid,
        origin: Uuid,
        role: Role,
        update: Vec<u8>,
        clock: u64,
    ) -> Result<Result<(), UpdateRejection>, RegistryError> {
        let handle = self.handle(doc_id).await.ok_or(RegistryError::DocumentClosed)?;
        handle
            .request(|reply| DocCommand::ApplyUpdate {
                origin,
                role,
                update,
                clock,
                reply,
            })
            .await
    }

    /// Incremental sync: diff the live doc against a remote state vector.
    pub async fn diff(
        &self,
        doc_id: Uuid,
        state_vector: Vec<u8>,
    ) -> Result<Result<Vec<u8>, UpdateRejection>, RegistryError> {
        let handle = self.handle(doc_id).await.ok_or(RegistryError::DocumentClosed)?;
        handle
            .request(|reply| DocCommand::Diff {
                state_vector,
                reply,
            })
            .await
    }

    /// Full current state of a live document, if any.
    pub async fn encode_state(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        let handle = self.handle(doc_id).await?;
        handle.request(|reply| DocCommand::EncodeState { reply }).await.ok()
    }

    /// Push a replacement state into a live document. Returns false when
    /// the document has no live actor (nothing to publish to).
    pub async fn replace_state(&self, doc_id: Uuid, state: Vec<u8>) -> Result<bool, UpdateRejection> {
        let Some(handle) = self.handle(doc_id).await else {
            return Ok(false);
        };
        match handle.request(|reply| DocCommand::ReplaceState { state, reply }).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(rejection)) => Err(rejection),
            // Actor raced shutdown; treat as not live.
            Err(_) => Ok(false),
        }
    }

    /// Broadcast a pre-encoded frame to a document's peers.
    pub async fn broadcast(&self, doc_id: Uuid, encoded: Arc<Vec<u8>>) {
        if let Some(handle) = self.handle(doc_id).await {
            let _ = handle.tx.send(DocCommand::Broadcast(encoded)).await;
        }
    }

    pub async fn conn_count(&self, doc_id: Uuid) -> usize {
        match self.handle(doc_id).await {
            Some(handle) => handle
                .request(|reply| DocCommand::ConnCount { reply })
                .await
                .unwrap_or(0),
            None => 0,
        }
    }

    pub async fn live_docs(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Detach a peer. When the last connection leaves, the actor survives a
    /// grace period (reconnects are common), then takes a final flush and
    /// shuts down.
    pub async fn detach(&self, doc_id: Uuid, peer_id: Uuid) {
        let Some(handle) = self.handle(doc_id).await else {
            return;
        };
        let _ = handle.tx.send(DocCommand::Detach { peer_id }).await;

        let docs = Arc::clone(&self.docs);
        let bridge = Arc::clone(&self.bridge);
        let grace = self.idle_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let count = handle
                .request(|reply| DocCommand::ConnCount { reply })
                .await
                .unwrap_or(0);
            if count > 0 {
                return;
            }

            // Flush while the actor is still live, so a re-attach right after
            // eviction hydrates the flushed state, never an older copy.
            if let Ok(Some(state)) = handle.request(|reply| DocCommand::TakeDirty { reply }).await {
                let meta = SnapshotMeta::new("system", "idle-detach", 0);
                if let Err(e) = bridge.flush(doc_id, &state, meta).await {
                    log::error!("Final flush for {} failed: {}", doc_id, e);
                }
            }

            // The write lock keeps new attaches from routing to the actor
            // while it decides; the map entry only goes away on a positive
            // verdict, so the one-live-instance guarantee holds.
            let residual = {
                let mut docs = docs.write().await;
                match handle.request(|reply| DocCommand::ShutdownIfIdle { reply }).await {
                    Ok(IdleVerdict::Busy) => return,
                    Ok(IdleVerdict::Stopped(state)) => {
                        docs.remove(&doc_id);
                        state
                    }
                    // Actor already stopped; an earlier eviction removed the
                    // entry (or a newer actor owns it now).
                    Err(_) => return,
                }
            };

            if let Some(state) = residual {
                let meta = SnapshotMeta::new("system", "idle-detach", 0);
                if let Err(e) = bridge.flush(doc_id, &state, meta).await {
                    log::error!("Final flush for {} failed: {}", doc_id, e);
                }
            }
            log::info!("Evicted idle document {}", doc_id);
        });
    }

    /// Flush every dirty live document. Returns how many were written.
    pub async fn flush_dirty(&self) -> usize {
        let handles: Vec<(Uuid, DocHandle)> = {
            let docs = self.docs.read().await;
            docs.iter().map(|(id, h)| (*id, h.clone())).collect()
        };

        let mut flushed = 0;
        for (doc_id, handle) in handles {
            let Ok(Some(state)) = handle.request(|reply| DocCommand::TakeDirty { reply }).await
            else {
                continue;
            };
            let clients = handle
                .request(|reply| DocCommand::ConnCount { reply })
                .await
                .unwrap_or(0) as u32;
            let meta = SnapshotMeta::new("system", "interval", clients);
            match self.bridge.flush(doc_id, &state, meta).await {
                Ok(_) => flushed += 1,
                Err(e) => log::error!("Interval flush for {} failed: {}", doc_id, e),
            }
        }
        flushed
    }

    async fn handle(&self, doc_id: Uuid) -> Option<DocHandle> {
        self.docs.read().await.get(&doc_id).cloned()
    }

    async fn handle_or_spawn(&self, doc_id: Uuid) -> DocHandle {
        if let Some(handle) = self.handle(doc_id).await {
            return handle;
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = DocHandle { tx };
        {
            let mut docs = self.docs.write().await;
            // Lost the race to another attach.
            if let Some(handle) = docs.get(&doc_id) {
                return handle.clone();
            }
            docs.insert(doc_id, handle.clone());
        }

        // Hydration does storage I/O; it runs after the lock is released so
        // other documents' command routing never waits on it. Commands sent
        // meanwhile queue in the mailbox.
        let bridge = Arc::clone(&self.bridge);
        let capacity = self.broadcast_capacity;
        tokio::spawn(async move {
            let state = tokio::task::spawn_blocking(move || bridge.load(doc_id))
                .await
                .unwrap_or_else(|e| {
                    log::error!("Hydration task for {} panicked: {}; starting empty", doc_id, e);
                    Vec::new()
                });
            let group = Arc::new(BroadcastGroup::new(capacity));
            log::info!("Spawned document actor {} ({} bytes hydrated)", doc_id, state.len());
            DocActor::hydrate(doc_id, &state, group).run(rx).await;
        });

        handle
    }
}
