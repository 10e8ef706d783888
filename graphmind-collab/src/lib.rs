//! # graphmind-collab — Real-time collaboration engine for GraphMind documents
//!
//! WebSocket-based multiplayer editing of mindmap documents using CRDT
//! synchronization, with durable version history and restore.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto    │  (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ Hello-gated
//!        ▼                                   ▼ (Authorizer)
//! ┌─────────────┐                     ┌─────────────┐
//! │ Yrs Doc     │                     │  Registry    │
//! │ (local)     │                     │  DocActor ×N │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                      ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                      │ Broadcast  │ │Persistence │ │  Restore   │
//!                      │ (fan-out)  │ │  Bridge    │ │Orchestrator│
//!                      └────────────┘ └─────┬──────┘ └─────┬──────┘
//!                                           ▼              ▼
//!                                    ┌─────────────────────────┐
//!                                    │ VersionStore (RocksDB)  │
//!                                    │  state / versions / idx │
//!                                    └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`auth`] — Connection gate backed by the authorization service
//! - [`broadcast`] — Per-document fan-out with backpressure
//! - [`registry`] — Actor-per-document merge layer
//! - [`presence`] — Ephemeral awareness channel (cursor/focus/selection)
//! - [`codec`] — Versioned snapshot envelope with legacy upgrade
//! - [`store`] — RocksDB-backed durable state and version history
//! - [`persistence`] — Flush/load bridge between live docs and the store
//! - [`restore`] — Version restore orchestration
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with offline queue

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod restore;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use auth::{AccessGrant, AuthError, Authorizer, HttpAuthorizer, Role, StaticAuthorizer};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use codec::{CodecError, EncodedForm, Snapshot, SnapshotMeta};
pub use persistence::{PersistenceBridge, PersistenceError};
pub use presence::{AwarenessUpdate, CursorPos, LocalPresence, PeerPresence, PresenceRoom};
pub use protocol::{MessageType, PeerInfo, ProtocolError, RestoreAckPayload, SyncMessage};
pub use registry::{AttachReply, Registry, RegistryError, UpdateRejection};
pub use restore::{
    LivePublisher, PublishOutcome, RegistryPublisher, RemotePublisher, RestoreError,
    RestoreOrchestrator, RestoreOutcome, RestoreReport,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{
    StoreConfig, StoreError, VersionKind, VersionRecord, VersionStore, VersionSummary,
};
