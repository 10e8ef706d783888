//! Version restore orchestration.
//!
//! Restoring a document to an earlier version walks a fixed sequence:
//! validate the request, back up whatever is durable right now, persist the
//! target as the new current state, then publish it into any live session.
//! The durable part either fully happens or the restore fails; publication
//! failures degrade the outcome instead of rolling anything back.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::AccessGrant;
use crate::codec::{self, CodecError, SnapshotMeta};
use crate::registry::Registry;
use crate::store::{StoreError, VersionKind, VersionRecord, VersionStore};

/// Restore errors. All of them leave the document untouched.
#[derive(Debug)]
pub enum RestoreError {
    /// Requester's role does not permit restores
    PermissionDenied,
    /// Version does not exist, or belongs to a different document
    NotFound,
    Decode(CodecError),
    Store(StoreError),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "Restore denied: insufficient role"),
            Self::NotFound => write!(f, "Version not found for this document"),
            Self::Decode(e) => write!(f, "Restore decode error: {e}"),
            Self::Store(e) => write!(f, "Restore store error: {e}"),
        }
    }
}

impl std::error::Error for RestoreError {}

impl From<CodecError> for RestoreError {
    fn from(e: CodecError) -> Self {
        Self::Decode(e)
    }
}

impl From<StoreError> for RestoreError {
    fn from(e: StoreError) -> Self {
        match e {
            // Cross-document references must look exactly like missing
            // versions to the caller.
            StoreError::NotFound(_) | StoreError::CrossDocumentReference { .. } => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// What happened on the live-session side of a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A live document picked up the restored state
    Published,
    /// No live session; clients will see the state on next attach
    NoLiveDoc,
    /// The live side could not be updated
    Unreachable(String),
}

/// Overall restore result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Durable state and live sessions both reflect the target
    Done,
    /// Durable state is restored but live sessions were not updated
    PartiallyDone,
}

/// Everything a caller needs to report back about a restore.
#[derive(Debug)]
pub struct RestoreReport {
    pub outcome: RestoreOutcome,
    /// Backup of the pre-restore state, when one was taken
    pub backup_version: Option<Uuid>,
    /// The version recording the restore itself
    pub restore_version: Uuid,
    pub publish: PublishOutcome,
}

/// Pushes restored state into live sessions. Seam between the orchestrator
/// and wherever the live documents actually run.
#[async_trait]
pub trait LivePublisher: Send + Sync {
    async fn publish(&self, doc_id: Uuid, state: Vec<u8>) -> PublishOutcome;
}

/// In-process publisher targeting the local registry.
pub struct RegistryPublisher {
    registry: Arc<Registry>,
}

impl RegistryPublisher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl LivePublisher for RegistryPublisher {
    async fn publish(&self, doc_id: Uuid, state: Vec<u8>) -> PublishOutcome {
        match self.registry.replace_state(doc_id, state).await {
            Ok(true) => PublishOutcome::Published,
            Ok(false) => PublishOutcome::NoLiveDoc,
            Err(rejection) => PublishOutcome::Unreachable(rejection.to_string()),
        }
    }
}

/// How long [`RemotePublisher`] waits for the server's acknowledgement.
const ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Out-of-process publisher: connects to a sync server over websocket,
/// pushes the restored state as a service frame and waits for the server's
/// acknowledgement.
pub struct RemotePublisher {
    server_url: String,
    service_token: String,
}

impl RemotePublisher {
    pub fn new(server_url: impl Into<String>, service_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            service_token: service_token.into(),
        }
    }
}

#[async_trait]
impl LivePublisher for RemotePublisher {
    async fn publish(&self, doc_id: Uuid, state: Vec<u8>) -> PublishOutcome {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let (mut ws, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(conn) => conn,
            Err(e) => return PublishOutcome::Unreachable(e.to_string()),
        };

        let frame = crate::protocol::SyncMessage::service_restore(doc_id, &self.service_token, state);
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => return PublishOutcome::Unreachable(e.to_string()),
        };
        if let Err(e) = ws.send(Message::Binary(encoded.into())).await {
            return PublishOutcome::Unreachable(e.to_string());
        }

        // A bare send proves nothing; wait for the server's verdict.
        let outcome = loop {
            let frame = match tokio::time::timeout(ACK_TIMEOUT, ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => data,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => break PublishOutcome::Unreachable(e.to_string()),
                Ok(None) => {
                    break PublishOutcome::Unreachable("closed before acknowledgement".into())
                }
                Err(_) => break PublishOutcome::Unreachable("acknowledgement timed out".into()),
            };
            let bytes: Vec<u8> = frame.into();
            let Ok(reply) = crate::protocol::SyncMessage::decode(&bytes) else {
                break PublishOutcome::Unreachable("undecodable acknowledgement".into());
            };
            match reply.restore_ack_payload() {
                Ok(ack) if ack.accepted && ack.live => break PublishOutcome::Published,
                Ok(ack) if ack.accepted => break PublishOutcome::NoLiveDoc,
                Ok(ack) => break PublishOutcome::Unreachable(ack.detail),
                Err(_) => match reply.rejection() {
                    Ok(rejection) => break PublishOutcome::Unreachable(rejection.reason),
                    Err(_) => continue,
                },
            }
        };
        let _ = ws.close(None).await;
        outcome
    }
}

/// Runs restores end to end against one store and one publisher.
pub struct RestoreOrchestrator {
    store: Arc<VersionStore>,
    publisher: Arc<dyn LivePublisher>,
}

impl RestoreOrchestrator {
    pub fn new(store: Arc<VersionStore>, publisher: Arc<dyn LivePublisher>) -> Self {
        Self { store, publisher }
    }

    /// Restore `doc_id` to `version_id` on behalf of `requester`.
    pub async fn restore(
        &self,
        doc_id: Uuid,
        version_id: Uuid,
        requester: &AccessGrant,
    ) -> Result<RestoreReport, RestoreError> {
        // Validating
        if !requester.role.can_edit() {
            return Err(RestoreError::PermissionDenied);
        }
        let target_record = self.store.get_version(doc_id, version_id)?;
        let target = codec::decode(&target_record.snapshot)?;
        log::info!(
            "Restore of {} to version {} requested by {}",
            doc_id,
            version_id,
            requester.user_id
        );

        // BackingUp
        let backup_version = self.backup_current(doc_id, &target.state, requester)?;

        // Persisting
        let creator = requester.user_id.to_string();
        let envelope = codec::encode(&target.state, SnapshotMeta::new(creator.as_str(), "restore", 0))?;
        let restore_record = VersionRecord::new(
            doc_id,
            envelope.clone(),
            creator.clone(),
            VersionKind::Restore,
            Some(format!("restoredFrom:{version_id}")),
        );
        // One batch: the current state must never be overwritten without
        // the restore record that explains it.
        self.store
            .create_version_with_state(&restore_record, &envelope)?;

        // Publishing
        let publish = self.publisher.publish(doc_id, target.state).await;
        let outcome = match &publish {
            PublishOutcome::Published | PublishOutcome::NoLiveDoc => RestoreOutcome::Done,
            PublishOutcome::Unreachable(e) => {
                log::warn!("Restore of {} persisted but not published: {}", doc_id, e);
                RestoreOutcome::PartiallyDone
            }
        };

        Ok(RestoreReport {
            outcome,
            backup_version,
            restore_version: restore_record.id,
            publish,
        })
    }

    /// Back up the current durable state unless it already equals the
    /// restore target. An unreadable current state always gets backed up:
    /// it cannot be proven identical, and the restore will overwrite it.
    fn backup_current(
        &self,
        doc_id: Uuid,
        target_state: &[u8],
        requester: &AccessGrant,
    ) -> Result<Option<Uuid>, RestoreError> {
        let Some(current) = self.store.latest_state(doc_id)? else {
            return Ok(None);
        };

        match codec::decode(&current) {
            Ok(snapshot) if snapshot.state == target_state => return Ok(None),
            Ok(_) => {}
            Err(e) => log::warn!("Backing up unreadable current state of {}: {}", doc_id, e),
        }

        let backup = VersionRecord::new(
            doc_id,
            current,
            requester.user_id.to_string(),
            VersionKind::Auto,
            Some("pre-restore backup".into()),
        );
        self.store.create_version(&backup)?;
        Ok(Some(backup.id))
    }
}
