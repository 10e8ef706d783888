//! Current durable document state, one envelope per document.
//!
//! This is the single "current" copy the persistence bridge hydrates from
//! and flushes to; history lives in the version catalogue next door.

use rocksdb::{WriteBatch, WriteOptions};
use uuid::Uuid;

use super::{StoreError, VersionKind, VersionRecord, VersionStore, CF_STATE};

impl VersionStore {
    /// Write the current durable state for a document.
    pub fn put_state(&self, doc_id: Uuid, envelope: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_STATE)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, doc_id.as_bytes(), envelope, &write_opts)?;
        Ok(())
    }

    /// Read the current durable state for a document, if any.
    pub fn latest_state(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_STATE)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?)
    }

    /// Whether a document has a durable current copy.
    pub fn state_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.latest_state(doc_id)?.is_some())
    }

    /// Delete a document's current state, writing a `delete-backup` version
    /// of it first so the deletion is recoverable.
    ///
    /// Returns the backup version id, or `None` if there was no state to
    /// back up.
    pub fn delete_document(
        &self,
        doc_id: Uuid,
        requester: impl Into<String>,
    ) -> Result<Option<Uuid>, StoreError> {
        let current = match self.latest_state(doc_id)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let backup = VersionRecord::new(
            doc_id,
            current,
            requester,
            VersionKind::DeleteBackup,
            Some("pre-deletion backup".into()),
        );
        let backup_id = self.create_version(&backup)?;

        let cf = self.cf(CF_STATE)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, doc_id.as_bytes());
        self.db.write(batch)?;

        Ok(Some(backup_id))
    }
}
