#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeMap;

use firebase_rs_sync::firestore::core::Query;
use firebase_rs_sync::firestore::local::{
    LocalStore, LocalStoreConfig, LruGarbageCollector, LruParams, MemoryPersistence,
};
use firebase_rs_sync::firestore::model::{
    BatchId, DocumentKey, FieldPath, MutableDocument, Mutation, MutationBatchResult,
    MutationResult, SnapshotVersion, Timestamp,
};
use firebase_rs_sync::firestore::remote::{RemoteEvent, TargetChange};
use firebase_rs_sync::firestore::value::{FirestoreValue, MapValue};

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn fields(pairs: &[(&str, i64)]) -> MapValue {
    let mut map = MapValue::empty();
    for (name, value) in pairs {
        map.set(
            &FieldPath::from_dot_separated(name).unwrap(),
            FirestoreValue::from_integer(*value),
        );
    }
    map
}

async fn primary_store() -> LocalStore {
    let persistence = MemoryPersistence::new("client");
    assert!(persistence.start().await.unwrap());
    LocalStore::new(persistence, "user", LocalStoreConfig::default())
}

/// Lets the backend deliver `documents` as the current contents of a fresh
/// `rooms` target and returns that target's id.
async fn seed_target(store: &LocalStore, seconds: i64, documents: &[(&str, MapValue)]) -> i32 {
    let target = store
        .allocate_target(Query::collection("rooms").unwrap().to_target())
        .await
        .unwrap();
    let mut change = TargetChange {
        resume_token: b"resume".to_vec(),
        current: true,
        ..TargetChange::default()
    };
    let mut updates = BTreeMap::new();
    for (path, data) in documents {
        change.added_documents.insert(key(path));
        updates.insert(
            key(path),
            MutableDocument::new_found_document(key(path), version(seconds), data.clone()),
        );
    }
    let event = RemoteEvent {
        snapshot_version: version(seconds),
        target_changes: BTreeMap::from([(target.target_id, change)]),
        document_updates: updates,
        ..RemoteEvent::default()
    };
    store.apply_remote_event(&event).await.unwrap();
    target.target_id
}

async fn acknowledge(store: &LocalStore, batch_id: BatchId, seconds: i64) {
    let batch = store.lookup_mutation_batch(batch_id).await.unwrap().unwrap();
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult {
            version: version(seconds),
            transform_results: Vec::new(),
        })
        .collect();
    let result = MutationBatchResult::from(batch, version(seconds), results, b"stream".to_vec()).unwrap();
    store.acknowledge_batch(&result).await.unwrap();
}

#[tokio::test]
async fn local_view_is_remote_state_plus_pending_batches() {
    let store = primary_store().await;
    seed_target(&store, 1, &[("rooms/a", fields(&[("x", 1), ("y", 1)]))]).await;

    let first = store
        .local_write(vec![Mutation::merge(key("rooms/a"), fields(&[("x", 2)])).unwrap()])
        .await
        .unwrap();
    let second = store
        .local_write(vec![Mutation::merge(key("rooms/a"), fields(&[("y", 3)])).unwrap()])
        .await
        .unwrap();
    let pending = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(pending.data(), &fields(&[("x", 2), ("y", 3)]));
    assert!(pending.has_local_mutations());

    acknowledge(&store, first.batch_id, 2).await;
    let after_ack = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(after_ack.data(), &fields(&[("x", 2), ("y", 3)]));
    assert!(after_ack.has_local_mutations());

    store.reject_batch(second.batch_id).await.unwrap();
    let after_reject = store.read_document(&key("rooms/a")).await.unwrap();
    assert_eq!(after_reject.data(), &fields(&[("x", 2), ("y", 1)]));
    assert!(!after_reject.has_local_mutations());
    assert!(store.next_mutation_batch(None).await.unwrap().is_none());
}

#[tokio::test]
async fn garbage_collection_spares_documents_with_pending_writes() {
    let store = primary_store().await;
    let target_id = seed_target(
        &store,
        1,
        &[("rooms/a", fields(&[("n", 1)])), ("rooms/b", fields(&[("n", 1)]))],
    )
    .await;
    let write = store
        .local_write(vec![Mutation::merge(key("rooms/b"), fields(&[("y", 2)])).unwrap()])
        .await
        .unwrap();
    store.release_target(target_id, false).await.unwrap();

    let collector = LruGarbageCollector::new(
        store.reference_delegate().clone(),
        LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..LruParams::default()
        },
    );
    // Releasing the target orphans its documents in the first run; the
    // second run collects them.
    let first = store.collect_garbage(&collector).await.unwrap();
    let second = store.collect_garbage(&collector).await.unwrap();
    assert_eq!(first.targets_removed, 1);
    assert_eq!(first.documents_removed + second.documents_removed, 1);

    assert!(!store.read_document(&key("rooms/a")).await.unwrap().is_found_document());

    acknowledge(&store, write.batch_id, 2).await;
    let settled = store.read_document(&key("rooms/b")).await.unwrap();
    assert!(settled.is_found_document());
    assert_eq!(settled.data(), &fields(&[("n", 1), ("y", 2)]));
    assert!(settled.has_committed_mutations());
}
