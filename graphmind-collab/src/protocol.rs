//! Binary wire protocol for the connection-gated sync channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A connection's first frame must be [`MessageType::Hello`] carrying the
//! bearer credential; no document state crosses the wire before the Access
//! Gate has answered. Service frames ([`MessageType::ServiceRestore`]) are
//! authenticated by a service-level token instead.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake: credential + display name. Must be the first frame.
    Hello = 1,
    /// State vector request for incremental sync
    SyncStep1 = 2,
    /// State diff response (also carries the full state after attach)
    SyncStep2 = 3,
    /// Incremental CRDT update
    Update = 4,
    /// Ephemeral presence update (never persisted)
    Awareness = 5,
    /// Peer joined notification
    PeerJoined = 6,
    /// Peer left notification
    PeerLeft = 7,
    /// Server → origin only: an update was refused (reason in payload)
    UpdateRejected = 8,
    /// Full-state replacement after a restore; receivers rebuild, not merge
    StateReplaced = 9,
    /// Request a manual (user-triggered) durable save
    ManualSave = 10,
    /// Service side-channel: push restored state into the live document
    ServiceRestore = 11,
    /// Heartbeat ping
    Ping = 12,
    /// Heartbeat pong
    Pong = 13,
    /// Server's verdict on a [`MessageType::ServiceRestore`] frame
    RestoreAck = 14,
}

/// Peer identity with display metadata, broadcast on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Handshake payload: end-user bearer credential plus display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelloPayload {
    pub credential: String,
    pub display_name: String,
}

/// Payload of an [`MessageType::UpdateRejected`] frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectionPayload {
    pub reason: String,
}

/// Payload of a [`MessageType::ManualSave`] frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualSavePayload {
    pub label: Option<String>,
}

/// Payload of a [`MessageType::ServiceRestore`] frame.
///
/// Authenticated by the service-level token, not an end-user credential.
/// `state` is the decoded replicated state (raw update bytes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRestorePayload {
    pub service_token: String,
    pub state: Vec<u8>,
}

/// Payload of a [`MessageType::RestoreAck`] frame.
///
/// A bare send proves nothing; the caller needs the server's verdict to
/// tell a published restore from a dropped one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreAckPayload {
    /// The frame was authenticated and processed
    pub accepted: bool,
    /// The state was pushed into a live document (false: no live doc)
    pub live: bool,
    /// Failure detail when `accepted` is false
    pub detail: String,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Lamport clock for causal ordering of updates
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a handshake message.
    pub fn hello(
        peer_id: Uuid,
        doc_id: Uuid,
        credential: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let payload = HelloPayload {
            credential: credential.into(),
            display_name: display_name.into(),
        };
        Self {
            msg_type: MessageType::Hello,
            peer_id,
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, doc_id: Uuid, clock: u64, crdt_update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            doc_id,
            clock,
            payload: crdt_update,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id,
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id,
            clock: 0,
            payload: state_diff,
        }
    }

    /// Create an awareness relay message with a pre-encoded presence payload.
    pub fn awareness(peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    /// Create a peer joined notification.
    pub fn peer_joined(peer_id: Uuid, doc_id: Uuid, info: &PeerInfo) -> Self {
        Self {
            msg_type: MessageType::PeerJoined,
            peer_id,
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(info, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a rejection notice for the origin connection.
    pub fn update_rejected(peer_id: Uuid, doc_id: Uuid, reason: impl Into<String>) -> Self {
        let payload = RejectionPayload {
            reason: reason.into(),
        };
        Self {
            msg_type: MessageType::UpdateRejected,
            peer_id,
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create a full-state replacement broadcast (post-restore).
    pub fn state_replaced(doc_id: Uuid, full_state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::StateReplaced,
            peer_id: Uuid::nil(),
            doc_id,
            clock: 0,
            payload: full_state,
        }
    }

    /// Create a manual save request.
    pub fn manual_save(peer_id: Uuid, doc_id: Uuid, label: Option<String>) -> Self {
        let payload = ManualSavePayload { label };
        Self {
            msg_type: MessageType::ManualSave,
            peer_id,
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create a service restore-trigger frame.
    pub fn service_restore(doc_id: Uuid, service_token: impl Into<String>, state: Vec<u8>) -> Self {
        let payload = ServiceRestorePayload {
            service_token: service_token.into(),
            state,
        };
        Self {
            msg_type: MessageType::ServiceRestore,
            peer_id: Uuid::nil(),
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create a restore-acknowledgement frame.
    pub fn restore_ack(doc_id: Uuid, accepted: bool, live: bool, detail: impl Into<String>) -> Self {
        let payload = RestoreAckPayload {
            accepted,
            live,
            detail: detail.into(),
        };
        Self {
            msg_type: MessageType::RestoreAck,
            peer_id: Uuid::nil(),
            doc_id,
            clock: 0,
            payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard())
                .unwrap_or_default(),
        }
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a handshake payload.
    pub fn hello_payload(&self) -> Result<HelloPayload, ProtocolError> {
        self.typed_payload(MessageType::Hello)
    }

    /// Parse a rejection payload.
    pub fn rejection(&self) -> Result<RejectionPayload, ProtocolError> {
        self.typed_payload(MessageType::UpdateRejected)
    }

    /// Parse a manual save payload.
    pub fn manual_save_payload(&self) -> Result<ManualSavePayload, ProtocolError> {
        self.typed_payload(MessageType::ManualSave)
    }

    /// Parse a service restore payload.
    pub fn service_restore_payload(&self) -> Result<ServiceRestorePayload, ProtocolError> {
        self.typed_payload(MessageType::ServiceRestore)
    }

    /// Parse a restore acknowledgement payload.
    pub fn restore_ack_payload(&self) -> Result<RestoreAckPayload, ProtocolError> {
        self.typed_payload(MessageType::RestoreAck)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.typed_payload(MessageType::PeerJoined)
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(
        &self,
        expected: MessageType,
    ) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
