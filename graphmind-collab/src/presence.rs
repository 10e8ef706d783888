//! Ephemeral presence/awareness channel.
//!
//! Per-connection metadata (cursor, focused node, selection) broadcast to
//! everyone attached to the same document, merged last-writer-wins per
//! field using a per-connection counter. A connection's removal is itself
//! broadcast as a deletion update. Nothing here ever touches storage —
//! process restarts drop presence by design.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Cursor position in document (canvas) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f32,
    pub y: f32,
}

impl CursorPos {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Wire payload carried inside an Awareness frame.
///
/// Only the fields a sender sets travel on the wire; unset fields leave the
/// receiver's view untouched. `counter` orders updates from the same
/// connection so stale frames arriving late cannot clobber newer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub user_id: Uuid,
    /// Per-connection lamport counter; last writer wins per field
    pub counter: u64,
    /// When true, receivers remove this peer entirely
    pub gone: bool,
    pub display_name: Option<String>,
    pub cursor: Option<CursorPos>,
    /// Mindmap node the user is focused on / editing
    pub focused_node: Option<String>,
    /// Selected node ids
    pub selection: Option<Vec<String>>,
}

impl AwarenessUpdate {
    pub fn new(user_id: Uuid, counter: u64) -> Self {
        Self {
            user_id,
            counter,
            gone: false,
            display_name: None,
            cursor: None,
            focused_node: None,
            selection: None,
        }
    }

    /// Deletion update broadcast when a connection detaches.
    pub fn gone(user_id: Uuid, counter: u64) -> Self {
        Self {
            gone: true,
            ..Self::new(user_id, counter)
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_cursor(mut self, x: f32, y: f32) -> Self {
        self.cursor = Some(CursorPos::new(x, y));
        self
    }

    pub fn with_focused_node(mut self, node_id: impl Into<String>) -> Self {
        self.focused_node = Some(node_id.into());
        self
    }

    pub fn with_selection(mut self, node_ids: Vec<String>) -> Self {
        self.selection = Some(node_ids);
        self
    }

    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// One field of a peer's presence with its LWW counter.
#[derive(Debug, Clone)]
struct Field<T> {
    value: Option<T>,
    counter: u64,
}

// Manual impl: the field starts unset whether or not T itself has a default.
impl<T> Default for Field<T> {
    fn default() -> Self {
        Self {
            value: None,
            counter: 0,
        }
    }
}

impl<T> Field<T> {
    fn apply(&mut self, incoming: Option<T>, counter: u64) {
        if let Some(value) = incoming {
            if counter >= self.counter {
                self.value = Some(value);
                self.counter = counter;
            }
        }
    }
}

/// A remote peer's merged presence view.
#[derive(Debug, Clone, Default)]
pub struct PeerPresence {
    pub user_id: Uuid,
    display_name: Field<String>,
    cursor: Field<CursorPos>,
    focused_node: Field<String>,
    selection: Field<Vec<String>>,
}

impl PeerPresence {
    fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.value.as_deref()
    }

    pub fn cursor(&self) -> Option<CursorPos> {
        self.cursor.value
    }

    pub fn focused_node(&self) -> Option<&str> {
        self.focused_node.value.as_deref()
    }

    pub fn selection(&self) -> Option<&[String]> {
        self.selection.value.as_deref()
    }
}

/// Aggregated presence for one document, as seen by one consumer.
#[derive(Default)]
pub struct PresenceRoom {
    peers: HashMap<Uuid, PeerPresence>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an incoming update. Returns false when the update was entirely
    /// stale (nothing changed).
    pub fn apply(&mut self, update: &AwarenessUpdate) -> bool {
        if update.gone {
            return self.peers.remove(&update.user_id).is_some();
        }

        let peer = self
            .peers
            .entry(update.user_id)
            .or_insert_with(|| PeerPresence::new(update.user_id));

        let before = (
            peer.display_name.counter,
            peer.cursor.counter,
            peer.focused_node.counter,
            peer.selection.counter,
        );

        peer.display_name
            .apply(update.display_name.clone(), update.counter);
        peer.cursor.apply(update.cursor, update.counter);
        peer.focused_node
            .apply(update.focused_node.clone(), update.counter);
        peer.selection.apply(update.selection.clone(), update.counter);

        before
            != (
                peer.display_name.counter,
                peer.cursor.counter,
                peer.focused_node.counter,
                peer.selection.counter,
            )
            || before == (0, 0, 0, 0)
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Producer side: generates counter-stamped updates for the local user.
pub struct LocalPresence {
    user_id: Uuid,
    counter: u64,
}

impl LocalPresence {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id, counter: 0 }
    }

    fn next(&mut self) -> AwarenessUpdate {
        self.counter += 1;
        AwarenessUpdate::new(self.user_id, self.counter)
    }

    pub fn cursor(&mut self, x: f32, y: f32) -> AwarenessUpdate {
        self.next().with_cursor(x, y)
    }

    pub fn focus(&mut self, node_id: impl Into<String>) -> AwarenessUpdate {
        self.next().with_focused_node(node_id)
    }

    pub fn select(&mut self, node_ids: Vec<String>) -> AwarenessUpdate {
        self.next().with_selection(node_ids)
    }

    pub fn join(&mut self, display_name: impl Into<String>) -> AwarenessUpdate {
        self.next().with_display_name(display_name)
    }

    pub fn leave(&mut self) -> AwarenessUpdate {
        self.counter += 1;
        AwarenessUpdate::gone(self.user_id, self.counter)
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let update = AwarenessUpdate::new(Uuid::new_v4(), 7)
            .with_display_name("Alice")
            .with_cursor(10.0, 20.0)
            .with_focused_node("n1")
            .with_selection(vec!["n1".into(), "n2".into()]);

        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_gone_roundtrip() {
        let update = AwarenessUpdate::gone(Uuid::new_v4(), 3);
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert!(decoded.gone);
    }

    #[test]
    fn test_room_merges_fields() {
        let user = Uuid::new_v4();
        let mut room = PresenceRoom::new();

        room.apply(&AwarenessUpdate::new(user, 1).with_display_name("Alice"));
        room.apply(&AwarenessUpdate::new(user, 2).with_cursor(5.0, 6.0));

        let peer = room.peer(&user).unwrap();
        assert_eq!(peer.display_name(), Some("Alice"));
        assert_eq!(peer.cursor(), Some(CursorPos::new(5.0, 6.0)));
    }

    #[test]
    fn test_fresh_peer_starts_unset() {
        let user = Uuid::new_v4();
        let mut room = PresenceRoom::new();

        // First frame carries only a cursor; every other field of the new
        // peer entry must start unset.
        room.apply(&AwarenessUpdate::new(user, 1).with_cursor(2.0, 4.0));

        let peer = room.peer(&user).unwrap();
        assert_eq!(peer.cursor(), Some(CursorPos::new(2.0, 4.0)));
        assert_eq!(peer.display_name(), None);
        assert_eq!(peer.focused_node(), None);
        assert_eq!(peer.selection(), None);
    }

    #[test]
    fn test_room_last_writer_wins() {
        let user = Uuid::new_v4();
        let mut room = PresenceRoom::new();

        room.apply(&AwarenessUpdate::new(user, 5).with_cursor(1.0, 1.0));
        // Stale frame arriving late must not clobber the newer cursor.
        room.apply(&AwarenessUpdate::new(user, 3).with_cursor(9.0, 9.0));

        assert_eq!(room.peer(&user).unwrap().cursor(), Some(CursorPos::new(1.0, 1.0)));
    }

    #[test]
    fn test_stale_frame_leaves_other_fields() {
        let user = Uuid::new_v4();
        let mut room = PresenceRoom::new();

        room.apply(&AwarenessUpdate::new(user, 5).with_focused_node("n9"));
        // Older counter, but the cursor field was never set — it applies.
        room.apply(&AwarenessUpdate::new(user, 2).with_cursor(3.0, 3.0));

        let peer = room.peer(&user).unwrap();
        assert_eq!(peer.focused_node(), Some("n9"));
        assert_eq!(peer.cursor(), Some(CursorPos::new(3.0, 3.0)));
    }

    #[test]
    fn test_gone_removes_peer() {
        let user = Uuid::new_v4();
        let mut room = PresenceRoom::new();

        room.apply(&AwarenessUpdate::new(user, 1).with_display_name("Alice"));
        assert_eq!(room.len(), 1);

        assert!(room.apply(&AwarenessUpdate::gone(user, 2)));
        assert!(room.is_empty());
    }

    #[test]
    fn test_gone_for_unknown_peer() {
        let mut room = PresenceRoom::new();
        assert!(!room.apply(&AwarenessUpdate::gone(Uuid::new_v4(), 1)));
    }

    #[test]
    fn test_local_presence_counter_increments() {
        let mut local = LocalPresence::new(Uuid::new_v4());

        let a = local.cursor(1.0, 1.0);
        let b = local.focus("n1");
        let c = local.leave();

        assert!(a.counter < b.counter);
        assert!(b.counter < c.counter);
        assert!(c.gone);
    }

    #[test]
    fn test_multiple_peers_tracked() {
        let mut room = PresenceRoom::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        room.apply(&AwarenessUpdate::new(alice, 1).with_display_name("Alice"));
        room.apply(&AwarenessUpdate::new(bob, 1).with_display_name("Bob"));

        assert_eq!(room.len(), 2);
        assert_eq!(room.peer(&alice).unwrap().display_name(), Some("Alice"));
        assert_eq!(room.peer(&bob).unwrap().display_name(), Some("Bob"));
    }

    #[test]
    fn test_update_size_small() {
        let update = AwarenessUpdate::new(Uuid::new_v4(), 1).with_cursor(100.0, 200.0);
        let encoded = update.encode().unwrap();
        assert!(encoded.len() < 64, "cursor update too large: {} bytes", encoded.len());
    }
}
