//! Append-only version catalogue.
//!
//! Key layout in CF `versions`:
//! `<doc_id:16><u64::MAX - created_at_ms:8 BE><version_id:16>` — a forward
//! prefix scan over a document yields versions newest-first, which is the
//! only order history browsing needs. CF `version_index` maps a bare
//! version id back to its full key so `get` can verify document ownership
//! before handing the record out.
//!
//! Records are never deleted by this subsystem; retention is an external
//! policy.

use rocksdb::{IteratorMode, WriteBatch, WriteOptions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StoreError, VersionStore, CF_STATE, CF_VERSIONS, CF_VERSION_INDEX};
use crate::codec;

/// Why a version record was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionKind {
    /// Explicit user save
    Manual,
    /// Periodic / idle flush, or the pre-restore backup
    Auto,
    /// Written when a restore completes
    Restore,
    /// Written before a document is deleted
    DeleteBackup,
}

impl std::fmt::Display for VersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionKind::Manual => write!(f, "manual"),
            VersionKind::Auto => write!(f, "auto"),
            VersionKind::Restore => write!(f, "restore"),
            VersionKind::DeleteBackup => write!(f, "delete-backup"),
        }
    }
}

/// A full version record, snapshot payload included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: Uuid,
    pub doc_id: Uuid,
    /// Encoded snapshot envelope (see [`crate::codec`])
    pub snapshot: Vec<u8>,
    pub creator_id: String,
    pub kind: VersionKind,
    pub label: Option<String>,
    /// Size of the encoded snapshot in bytes
    pub size_bytes: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl VersionRecord {
    /// Build a record around an already-encoded snapshot envelope.
    pub fn new(
        doc_id: Uuid,
        snapshot: Vec<u8>,
        creator_id: impl Into<String>,
        kind: VersionKind,
        label: Option<String>,
    ) -> Self {
        let size_bytes = snapshot.len() as u64;
        Self {
            id: Uuid::new_v4(),
            doc_id,
            snapshot,
            creator_id: creator_id.into(),
            kind,
            label,
            size_bytes,
            created_at: codec::now_ms(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    /// Payload-free view for history listings.
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            doc_id: self.doc_id,
            creator_id: self.creator_id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            size_bytes: self.size_bytes,
            created_at: self.created_at,
        }
    }
}

/// Version metadata without the snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub doc_id: Uuid,
    pub creator_id: String,
    pub kind: VersionKind,
    pub label: Option<String>,
    pub size_bytes: u64,
    pub created_at: u64,
}

impl VersionStore {
    /// Append a version record. Returns the record id.
    pub fn create_version(&self, record: &VersionRecord) -> Result<Uuid, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let key = Self::version_key(record.doc_id, record.created_at, record.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_versions, &key, record.encode()?);
        batch.put_cf(&cf_index, record.id.as_bytes(), &key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record.id)
    }

    /// Append a version record and replace the document's current durable
    /// state in one atomic batch.
    ///
    /// Callers that persist a snapshot and its history entry together must
    /// use this instead of `put_state` + `create_version`; a crash between
    /// two separate writes would leave the state overwritten without the
    /// record that explains it.
    pub fn create_version_with_state(
        &self,
        record: &VersionRecord,
        state: &[u8],
    ) -> Result<Uuid, StoreError> {
        let cf_state = self.cf(CF_STATE)?;
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let key = Self::version_key(record.doc_id, record.created_at, record.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_state, record.doc_id.as_bytes(), state);
        batch.put_cf(&cf_versions, &key, record.encode()?);
        batch.put_cf(&cf_index, record.id.as_bytes(), &key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(record.id)
    }

    /// List a document's versions, newest first, payloads excluded.
    pub fn list_versions(&self, doc_id: Uuid) -> Result<Vec<VersionSummary>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;

        let mut start_key = Vec::with_capacity(16);
        start_key.extend_from_slice(doc_id.as_bytes());

        let mut summaries = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 16 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let record = VersionRecord::decode(&value)?;
            summaries.push(record.summary());
        }

        Ok(summaries)
    }

    /// Fetch one version record, snapshot payload included.
    ///
    /// Rejects version ids that belong to a different document.
    pub fn get_version(&self, doc_id: Uuid, version_id: Uuid) -> Result<VersionRecord, StoreError> {
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let cf_versions = self.cf(CF_VERSIONS)?;

        let key = self
            .db
            .get_cf(&cf_index, version_id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("version {version_id}")))?;

        if key.len() < 16 || key[..16] != doc_id.as_bytes()[..] {
            return Err(StoreError::CrossDocumentReference { version_id, doc_id });
        }

        let bytes = self
            .db
            .get_cf(&cf_versions, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("version {version_id}")))?;

        VersionRecord::decode(&bytes)
    }

    /// Count versions stored for a document.
    pub fn version_count(&self, doc_id: Uuid) -> Result<usize, StoreError> {
        Ok(self.list_versions(doc_id)?.len())
    }

    /// Build a versions key: doc_id + reverse timestamp + version id.
    fn version_key(doc_id: Uuid, created_at: u64, version_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&(u64::MAX - created_at).to_be_bytes());
        key.extend_from_slice(version_id.as_bytes());
        key
    }
}
