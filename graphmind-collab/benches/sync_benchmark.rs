use criterion::{black_box, criterion_group, criterion_main, Criterion};
use graphmind_collab::broadcast::BroadcastGroup;
use graphmind_collab::codec::{self, SnapshotMeta};
use graphmind_collab::presence::{AwarenessUpdate, PresenceRoom};
use graphmind_collab::protocol::{PeerInfo, SyncMessage};
use std::sync::Arc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact, Update, WriteTxn};

/// Encoded state of a mindmap with `n` nodes.
fn mindmap_state(n: usize) -> Vec<u8> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let nodes = txn.get_or_insert_map("nodes");
        for i in 0..n {
            nodes.insert(&mut txn, format!("n{i}"), format!("Node {i} content"));
        }
    }
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    update
}

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical small update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(peer),
                black_box(doc),
                black_box(1),
                black_box(update.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let msg = SyncMessage::update(peer, doc, 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let update = AwarenessUpdate::new(Uuid::new_v4(), 1)
        .with_display_name("Alice")
        .with_cursor(100.0, 200.0)
        .with_focused_node("n42");

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            black_box(black_box(&update).encode().unwrap());
        })
    });
}

fn bench_presence_merge(c: &mut Criterion) {
    let users: Vec<Uuid> = (0..32).map(|_| Uuid::new_v4()).collect();

    c.bench_function("presence_merge_32_peers", |b| {
        b.iter(|| {
            let mut room = PresenceRoom::new();
            for (i, user) in users.iter().enumerate() {
                let update = AwarenessUpdate::new(*user, i as u64).with_cursor(i as f32, i as f32);
                room.apply(black_box(&update));
            }
            black_box(room.len());
        })
    });
}

fn bench_snapshot_encode_100_nodes(c: &mut Criterion) {
    let state = mindmap_state(100);
    let meta = SnapshotMeta::new("system", "interval", 4);

    c.bench_function("snapshot_encode_100_nodes", |b| {
        b.iter(|| {
            black_box(codec::encode(black_box(&state), meta.clone()).unwrap());
        })
    });
}

fn bench_snapshot_decode_100_nodes(c: &mut Criterion) {
    let state = mindmap_state(100);
    let encoded = codec::encode(&state, SnapshotMeta::new("system", "interval", 4)).unwrap();

    c.bench_function("snapshot_decode_100_nodes", |b| {
        b.iter(|| {
            black_box(codec::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_crdt_merge(c: &mut Criterion) {
    let incoming = mindmap_state(10);

    c.bench_function("crdt_merge_10_nodes", |b| {
        b.iter(|| {
            let doc = Doc::new();
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(black_box(&incoming)).unwrap())
                .unwrap();
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(256);
    let receivers: Vec<_> = rt.block_on(async {
        let mut rxs = Vec::new();
        for i in 0..16 {
            rxs.push(group.add_peer(PeerInfo::new(format!("peer{i}"))).await);
        }
        rxs
    });
    let payload = Arc::new(vec![0u8; 128]);

    c.bench_function("broadcast_128B_16_peers", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(black_box(Arc::clone(&payload))));
        })
    });

    drop(receivers);
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_presence_merge,
    bench_snapshot_encode_100_nodes,
    bench_snapshot_decode_100_nodes,
    bench_crdt_merge,
    bench_broadcast_raw,
);
criterion_main!(benches);
