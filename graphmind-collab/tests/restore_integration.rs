//! Integration tests for restore against live sessions.
//!
//! Covers the full path: version history in the store, the orchestrator's
//! backup/persist/publish sequence, and live clients observing a
//! state replacement over a real websocket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use graphmind_collab::auth::{AccessGrant, Role, StaticAuthorizer};
use graphmind_collab::client::{SyncClient, SyncEvent};
use graphmind_collab::codec::{self, SnapshotMeta};
use graphmind_collab::restore::{
    PublishOutcome, RegistryPublisher, RemotePublisher, RestoreOrchestrator, RestoreOutcome,
};
use graphmind_collab::server::{ServerConfig, SyncServer};
use graphmind_collab::store::{VersionKind, VersionRecord};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, Map, Out, ReadTxn, StateVector, Transact, Update, WriteTxn};

const SERVICE_TOKEN: &str = "svc-secret";

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_server(doc_id: Uuid, dir: &TempDir) -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        flush_interval_secs: 3600,
        idle_grace_secs: 3600,
        storage_path: dir.path().to_path_buf(),
        service_token: SERVICE_TOKEN.to_string(),
    };
    let authorizer = StaticAuthorizer::new().allow_doc(
        "alice-token",
        doc_id,
        Uuid::new_v4(),
        Role::Editor,
    );
    let server = Arc::new(SyncServer::new(config, Arc::new(authorizer)).unwrap());
    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn next_matching(
    rx: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event channel closed while waiting"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

fn node_update(key: &str, text: &str) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let nodes = txn.get_or_insert_map("nodes");
        nodes.insert(&mut txn, key, text);
    }
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    update
}

fn nodes_of(state: &[u8]) -> HashMap<String, String> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let mut txn = doc.transact_mut();
    let nodes = txn.get_or_insert_map("nodes");
    let mut out = HashMap::new();
    for (key, value) in nodes.iter(&txn) {
        if let Out::Any(Any::String(s)) = value {
            out.insert(key.to_string(), s.to_string());
        }
    }
    out
}

fn editor() -> AccessGrant {
    AccessGrant {
        user_id: Uuid::new_v4(),
        role: Role::Editor,
    }
}

/// Seed a manual version holding a single n1 node; returns its id.
fn seed_version(server: &SyncServer, doc_id: Uuid, text: &str) -> Uuid {
    let envelope =
        codec::encode(&node_update("n1", text), SnapshotMeta::new("alice", "manual", 1)).unwrap();
    let record = VersionRecord::new(doc_id, envelope, "alice", VersionKind::Manual, None);
    server.store().create_version(&record).unwrap();
    record.id
}

#[tokio::test]
async fn test_restore_publishes_into_live_session() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    // A live session with edits the restore will replace.
    let mut alice = SyncClient::new("Alice", "alice-token", doc_id, &url);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::StateSynced(_))).await;
    alice.send_update(node_update("n2", "World")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RegistryPublisher::new(Arc::clone(server.registry()))),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Done);
    assert_eq!(report.publish, PublishOutcome::Published);

    // The connected client is told to rebuild from the restored state.
    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::StateReplaced(_))).await;
    let SyncEvent::StateReplaced(state) = event else {
        unreachable!()
    };
    let nodes = nodes_of(&state);
    assert_eq!(nodes.get("n1").map(String::as_str), Some("Hello"));
    assert!(!nodes.contains_key("n2"), "restored state must not merge current edits");

    // The live doc only holds the restored content.
    let live = server.registry().encode_state(doc_id).await.unwrap();
    assert!(!nodes_of(&live).contains_key("n2"));
}

#[tokio::test]
async fn test_restore_without_live_session_is_done() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, _url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RegistryPublisher::new(Arc::clone(server.registry()))),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::Done);
    assert_eq!(report.publish, PublishOutcome::NoLiveDoc);

    // Durable state changed anyway; the next attach will see it.
    let stored = server.store().latest_state(doc_id).unwrap().unwrap();
    let snapshot = codec::decode(&stored).unwrap();
    assert_eq!(nodes_of(&snapshot.state).get("n1").map(String::as_str), Some("Hello"));
}

#[tokio::test]
async fn test_restore_backs_up_live_edits() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    let mut alice = SyncClient::new("Alice", "alice-token", doc_id, &url);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::StateSynced(_))).await;
    alice.send_update(node_update("n2", "World")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Make the edits durable so the backup can see them.
    server.registry().flush_dirty().await;

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RegistryPublisher::new(Arc::clone(server.registry()))),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    let backup_id = report.backup_version.expect("backup taken");
    let backup = server.store().get_version(doc_id, backup_id).unwrap();
    let snapshot = codec::decode(&backup.snapshot).unwrap();
    assert_eq!(nodes_of(&snapshot.state).get("n2").map(String::as_str), Some("World"));
}

#[tokio::test]
async fn test_remote_publisher_pushes_over_websocket() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    let mut alice = SyncClient::new("Alice", "alice-token", doc_id, &url);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::StateSynced(_))).await;

    // Orchestrator in a separate "service" role, talking to the server
    // over its public socket.
    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RemotePublisher::new(&url, SERVICE_TOKEN)),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();
    assert_eq!(report.outcome, RestoreOutcome::Done);
    // The server acknowledged a push into a live document.
    assert_eq!(report.publish, PublishOutcome::Published);

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::StateReplaced(_))).await;
    let SyncEvent::StateReplaced(state) = event else {
        unreachable!()
    };
    assert_eq!(nodes_of(&state).get("n1").map(String::as_str), Some("Hello"));
}

#[tokio::test]
async fn test_remote_publisher_reports_no_live_doc() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    // Nobody is attached; the server's acknowledgement says so.
    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RemotePublisher::new(&url, SERVICE_TOKEN)),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::Done);
    assert_eq!(report.publish, PublishOutcome::NoLiveDoc);
}

#[tokio::test]
async fn test_remote_publisher_rejected_token_is_partial() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    // A live session that must remain untouched by the refused push.
    let mut alice = SyncClient::new("Alice", "alice-token", doc_id, &url);
    let mut events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    next_matching(&mut events, |e| matches!(e, SyncEvent::StateSynced(_))).await;

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RemotePublisher::new(&url, "wrong-token")),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    // The refusal is visible, not silently reported as a success.
    assert_eq!(report.outcome, RestoreOutcome::PartiallyDone);
    let PublishOutcome::Unreachable(reason) = &report.publish else {
        panic!("expected unreachable, got {:?}", report.publish);
    };
    assert!(reason.contains("token"), "reason was: {reason}");

    // Nothing reached the live document.
    let live = server.registry().encode_state(doc_id).await.unwrap();
    assert!(!nodes_of(&live).contains_key("n1"));
}

#[tokio::test]
async fn test_remote_publisher_unreachable_is_partial() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, _url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        // Nothing listens here.
        Arc::new(RemotePublisher::new("ws://127.0.0.1:1", SERVICE_TOKEN)),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::PartiallyDone);
    assert!(matches!(report.publish, PublishOutcome::Unreachable(_)));

    // Durable restore still happened.
    let stored = server.store().latest_state(doc_id).unwrap().unwrap();
    assert!(codec::decode(&stored).is_ok());
}

#[tokio::test]
async fn test_restore_history_is_auditable() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let (server, _url) = start_test_server(doc_id, &dir).await;
    let version_id = seed_version(&server, doc_id, "Hello");

    // A differing current state so a backup happens.
    let current =
        codec::encode(&node_update("n2", "World"), SnapshotMeta::new("system", "interval", 1))
            .unwrap();
    server.store().put_state(doc_id, &current).unwrap();

    let orchestrator = RestoreOrchestrator::new(
        Arc::clone(server.store()),
        Arc::new(RegistryPublisher::new(Arc::clone(server.registry()))),
    );
    let report = orchestrator
        .restore(doc_id, version_id, &editor())
        .await
        .unwrap();

    // Newest first: restore record, then the backup, then the original.
    let versions = server.store().list_versions(doc_id).unwrap();
    assert_eq!(versions.len(), 3);

    let kinds: Vec<VersionKind> = versions.iter().map(|v| v.kind).collect();
    assert!(kinds.contains(&VersionKind::Restore));
    assert!(kinds.contains(&VersionKind::Auto));
    assert!(kinds.contains(&VersionKind::Manual));

    let restore_record = server.store().get_version(doc_id, report.restore_version).unwrap();
    assert_eq!(
        restore_record.label,
        Some(format!("restoredFrom:{version_id}"))
    );
}
