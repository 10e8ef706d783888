//! Snapshot codec: versioned, storable envelopes around replicated state.
//!
//! Storable format:
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ "GMSN" │ bincode { schema_version, lz4(state), meta,  │
//! │ 4 bytes│           created_at }                       │
//! └────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Decoding resolves a tagged union exactly once: bytes starting with the
//! magic are a [`Snapshot`] envelope, anything else is treated as the legacy
//! raw-binary encoding (a bare CRDT state update) and upgraded to the
//! current schema on read. The legacy path is a one-way compatibility shim;
//! encoding always writes the current schema.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use yrs::updates::decoder::Decode;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Envelope magic prefix.
const MAGIC: &[u8; 4] = b"GMSN";

/// Provenance reason recorded when a legacy blob is upgraded.
pub const LEGACY_REASON: &str = "converted from legacy format";

/// Provenance metadata carried inside every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Who produced the snapshot (user id or subsystem name)
    pub created_by: String,
    /// Why it was produced ("interval", "idle-detach", "manual", "restore", …)
    pub reason: String,
    /// Connections attached when the snapshot was taken
    pub client_count: u32,
}

impl SnapshotMeta {
    pub fn new(created_by: impl Into<String>, reason: impl Into<String>, client_count: u32) -> Self {
        Self {
            created_by: created_by.into(),
            reason: reason.into(),
            client_count,
        }
    }
}

/// A decoded snapshot: raw replicated state plus provenance.
///
/// Immutable once created; produced by the persistence bridge (flush) or
/// the restore orchestrator (backup/restore), written once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub schema_version: u16,
    /// Raw CRDT state update bytes (uncompressed)
    pub state: Vec<u8>,
    pub meta: SnapshotMeta,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// On-disk body following the magic prefix.
#[derive(Serialize, Deserialize)]
struct Envelope {
    schema_version: u16,
    compressed_state: Vec<u8>,
    meta: SnapshotMeta,
    created_at: u64,
}

/// The two encodings a stored blob can carry, resolved once at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedForm<'a> {
    /// Current schema-wrapped envelope
    Versioned(&'a [u8]),
    /// Bare CRDT state update with no wrapper
    Legacy(&'a [u8]),
}

/// Codec errors.
#[derive(Debug, Clone)]
pub enum CodecError {
    /// The blob is neither a valid envelope nor a valid legacy state
    Decode(String),
    /// Envelope carries a schema this build does not understand
    UnknownSchema(u16),
    Compression(String),
    Serialization(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Snapshot decode error: {e}"),
            Self::UnknownSchema(v) => write!(f, "Unknown snapshot schema version: {v}"),
            Self::Compression(e) => write!(f, "Snapshot compression error: {e}"),
            Self::Serialization(e) => write!(f, "Snapshot serialization error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Classify a stored blob without decoding it.
pub fn classify(bytes: &[u8]) -> EncodedForm<'_> {
    if bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC {
        EncodedForm::Versioned(&bytes[MAGIC.len()..])
    } else {
        EncodedForm::Legacy(bytes)
    }
}

/// Encode raw state into a storable envelope under the current schema.
pub fn encode(state: &[u8], meta: SnapshotMeta) -> Result<Vec<u8>, CodecError> {
    encode_snapshot(&Snapshot {
        schema_version: SCHEMA_VERSION,
        state: state.to_vec(),
        meta,
        created_at: now_ms(),
    })
}

/// Encode an existing snapshot into its storable form.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        schema_version: snapshot.schema_version,
        compressed_state: lz4_flex::compress_prepend_size(&snapshot.state),
        meta: snapshot.meta.clone(),
        created_at: snapshot.created_at,
    };
    let body = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(MAGIC.len() + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a stored blob into a snapshot, upgrading legacy blobs on the fly.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, CodecError> {
    match classify(bytes) {
        EncodedForm::Versioned(body) => {
            let (envelope, _): (Envelope, _) =
                bincode::serde::decode_from_slice(body, bincode::config::standard())
                    .map_err(|e| CodecError::Decode(e.to_string()))?;

            if envelope.schema_version != SCHEMA_VERSION {
                return Err(CodecError::UnknownSchema(envelope.schema_version));
            }

            let state = lz4_flex::decompress_size_prepended(&envelope.compressed_state)
                .map_err(|e| CodecError::Compression(e.to_string()))?;

            Ok(Snapshot {
                schema_version: envelope.schema_version,
                state,
                meta: envelope.meta,
                created_at: envelope.created_at,
            })
        }
        EncodedForm::Legacy(raw) => {
            // A legacy blob must at least be a parseable state update,
            // otherwise this is corruption, not an old format.
            yrs::Update::decode_v1(raw).map_err(|e| CodecError::Decode(e.to_string()))?;

            Ok(Snapshot {
                schema_version: SCHEMA_VERSION,
                state: raw.to_vec(),
                meta: SnapshotMeta::new("unknown", LEGACY_REASON, 0),
                created_at: now_ms(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::decoder::Decode;
    use yrs::{Map, ReadTxn, StateVector, Transact, WriteTxn};

    /// Encode a small mindmap doc state for use as test payload.
    fn sample_state() -> Vec<u8> {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let nodes = txn.get_or_insert_map("nodes");
            nodes.insert(&mut txn, "n1", "Hello");
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_roundtrip() {
        let state = sample_state();
        let meta = SnapshotMeta::new("user-1", "manual", 2);

        let encoded = encode(&state, meta.clone()).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
        assert_eq!(decoded.state, state);
        assert_eq!(decoded.meta, meta);
        assert!(decoded.created_at > 0);
    }

    #[test]
    fn test_classify() {
        let state = sample_state();
        let encoded = encode(&state, SnapshotMeta::new("s", "interval", 0)).unwrap();

        assert!(matches!(classify(&encoded), EncodedForm::Versioned(_)));
        assert!(matches!(classify(&state), EncodedForm::Legacy(_)));
        assert!(matches!(classify(&[]), EncodedForm::Legacy(_)));
    }

    #[test]
    fn test_legacy_upgrade() {
        let state = sample_state();

        // A bare state update decodes as a schema-wrapped snapshot.
        let decoded = decode(&state).unwrap();
        assert_eq!(decoded.schema_version, SCHEMA_VERSION);
        assert_eq!(decoded.state, state);
        assert_eq!(decoded.meta.reason, LEGACY_REASON);
    }

    #[test]
    fn test_legacy_equals_versioned() {
        let state = sample_state();
        let wrapped = encode(&state, SnapshotMeta::new("s", "interval", 1)).unwrap();

        let from_legacy = decode(&state).unwrap();
        let from_wrapped = decode(&wrapped).unwrap();
        assert_eq!(from_legacy.state, from_wrapped.state);
    }

    #[test]
    fn test_garbage_rejected() {
        let garbage = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01];
        assert!(matches!(decode(&garbage), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let state = sample_state();
        let snapshot = Snapshot {
            schema_version: 99,
            state,
            meta: SnapshotMeta::new("s", "interval", 0),
            created_at: now_ms(),
        };
        let encoded = encode_snapshot(&snapshot).unwrap();

        assert!(matches!(decode(&encoded), Err(CodecError::UnknownSchema(99))));
    }

    #[test]
    fn test_compression_shrinks_repetitive_state() {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let nodes = txn.get_or_insert_map("nodes");
            for i in 0..200 {
                nodes.insert(&mut txn, format!("node-{i}"), "repeated node text payload");
            }
        }
        let state = doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default());

        let encoded = encode(&state, SnapshotMeta::new("s", "interval", 0)).unwrap();
        assert!(
            encoded.len() < state.len(),
            "envelope {} should be smaller than raw state {}",
            encoded.len(),
            state.len()
        );
    }

    #[test]
    fn test_decoded_state_applies() {
        let state = sample_state();
        let encoded = encode(&state, SnapshotMeta::new("s", "interval", 0)).unwrap();
        let decoded = decode(&encoded).unwrap();

        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            let update = yrs::Update::decode_v1(&decoded.state).unwrap();
            txn.apply_update(update).unwrap();
        }
        let txn = doc.transact();
        let nodes = txn.get_map("nodes").unwrap();
        assert!(nodes.get(&txn, "n1").is_some());
    }
}
