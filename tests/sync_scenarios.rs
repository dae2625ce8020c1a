#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firebase_rs_sync::firestore::core::{
    ChangeType, FieldFilter, FilterOperator, FirestoreClient, FirestoreClientComponents,
    FirestoreClientSettings, ListenOptions, ListenerRegistration, Query, ViewSnapshot,
};
use firebase_rs_sync::firestore::local::MemoryPersistence;
use firebase_rs_sync::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, Mutation, SnapshotVersion, Timestamp,
};
use firebase_rs_sync::firestore::remote::{BloomFilter, InMemoryBackend, NoopTokenProvider, ServerStream};
use firebase_rs_sync::firestore::value::{FirestoreValue, MapValue};
use firebase_rs_sync::platform::runtime;
use serde_json::Value as JsonValue;

struct Fixture {
    backend: InMemoryBackend,
    client: FirestoreClient,
}

async fn start_client() -> Fixture {
    let database_id = DatabaseId::new("p", "(default)");
    let (backend, datastore) = InMemoryBackend::pair(database_id.clone());
    let client = FirestoreClient::start(
        FirestoreClientComponents {
            database_id,
            datastore: Arc::new(datastore),
            auth_provider: Arc::new(NoopTokenProvider),
            app_check_provider: None,
            persistence: MemoryPersistence::new("client"),
        },
        FirestoreClientSettings::default(),
    )
    .await
    .expect("start client");
    Fixture { backend, client }
}

type Snapshots = Arc<Mutex<Vec<ViewSnapshot>>>;

async fn listen(client: &FirestoreClient, query: Query) -> (ListenerRegistration, Snapshots) {
    let snapshots: Snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    let registration = client
        .listen(query, ListenOptions::default(), move |outcome| {
            if let Ok(snapshot) = outcome {
                sink.lock().unwrap().push(snapshot);
            }
        })
        .await
        .expect("listen");
    (registration, snapshots)
}

async fn wait_for<F>(snapshots: &Snapshots, condition: F)
where
    F: Fn(&[ViewSnapshot]) -> bool,
{
    for _ in 0..300 {
        if condition(&snapshots.lock().unwrap()) {
            return;
        }
        runtime::sleep(Duration::from_millis(10)).await;
    }
    panic!("snapshot condition not reached");
}

async fn wait_for_cached_document(client: &FirestoreClient, path: &str) -> MutableDocument {
    for _ in 0..300 {
        if let Ok(Some(document)) = client.get_document_from_local_cache(key(path)).await {
            return document;
        }
        runtime::sleep(Duration::from_millis(10)).await;
    }
    panic!("{path} never reached the cache");
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn field(name: &str, value: FirestoreValue) -> MapValue {
    let mut data = MapValue::empty();
    data.set(&FieldPath::from_dot_separated(name).unwrap(), value);
    data
}

fn red() -> MapValue {
    field("color", FirestoreValue::from_string("red"))
}

fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot.docs.keys().map(ToString::to_string).collect()
}

fn added_target_id(request: &JsonValue) -> i32 {
    request["addTarget"]["targetId"]
        .as_i64()
        .expect("watch request adds a target") as i32
}

async fn send_all(stream: &ServerStream, messages: &[JsonValue]) {
    for message in messages {
        stream.send_json(message).await.unwrap();
    }
}

/// Acknowledges `target_id` with `documents` at `seconds` and marks it current.
async fn deliver_current_target(
    backend: &InMemoryBackend,
    watch: &ServerStream,
    target_id: i32,
    documents: &[&str],
    seconds: i64,
) {
    let mut messages = vec![backend.target_change("ADD", &[target_id], b"", None)];
    for path in documents {
        messages.push(
            backend
                .document_change(&key(path), version(seconds), &red(), &[target_id], &[])
                .unwrap(),
        );
    }
    messages.push(backend.target_change("CURRENT", &[target_id], b"", None));
    messages.push(backend.global_snapshot(version(seconds), format!("t{seconds}").as_bytes()));
    send_all(watch, &messages).await;
}

#[tokio::test]
async fn offline_write_is_readable_and_settles_after_ack() {
    let fixture = start_client().await;
    let client = fixture.client.clone();
    client.disable_network().await.unwrap();

    let x_is_1 = field("x", FirestoreValue::from_integer(1));
    let writer = client.clone();
    let mutation = Mutation::set(key("rooms/a"), x_is_1.clone()).unwrap();
    let pending = tokio::spawn(async move { writer.write(vec![mutation]).await });

    let cached = wait_for_cached_document(&client, "rooms/a").await;
    assert!(cached.has_local_mutations());
    assert_eq!(cached.data(), &x_is_1);

    client.enable_network().await.unwrap();
    let backend = &fixture.backend;
    let write = backend.accept_write().await.unwrap();
    let handshake = write.expect_json().await.unwrap();
    assert!(handshake.get("writes").is_none());
    write.send_json(&backend.handshake_response(b"s1")).await.unwrap();
    let request = write.expect_json().await.unwrap();
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    write
        .send_json(&backend.write_response(b"s2", version(7), &[version(7)]))
        .await
        .unwrap();

    pending.await.unwrap().unwrap();
    let settled = client
        .get_document_from_local_cache(key("rooms/a"))
        .await
        .unwrap()
        .expect("document stays cached");
    assert!(!settled.has_local_mutations());
    assert_eq!(settled.version(), version(7));
    assert_eq!(settled.data(), &x_is_1);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn limit_window_swaps_highest_key_for_new_lower_match() {
    let fixture = start_client().await;
    let backend = &fixture.backend;
    let (_all_registration, all) = listen(&fixture.client, Query::collection("rooms").unwrap()).await;

    let watch = backend.accept_listen().await.unwrap();
    let all_target = added_target_id(&watch.expect_json().await.unwrap());
    deliver_current_target(backend, &watch, all_target, &["rooms/b", "rooms/c", "rooms/d"], 1).await;
    wait_for(&all, |snapshots| {
        snapshots
            .last()
            .is_some_and(|latest| !latest.from_cache && latest.docs.len() == 3)
    })
    .await;

    let red_limit_two = Query::collection("rooms")
        .unwrap()
        .with_filter(
            FieldFilter::new(
                FieldPath::from_dot_separated("color").unwrap(),
                FilterOperator::Equal,
                FirestoreValue::from_string("red"),
            )
            .unwrap(),
        )
        .with_limit_to_first(2);
    let (_registration, limited) = listen(&fixture.client, red_limit_two).await;
    wait_for(&limited, |snapshots| !snapshots.is_empty()).await;
    {
        let snapshots = limited.lock().unwrap();
        assert_eq!(keys(&snapshots[0]), vec!["rooms/b", "rooms/c"]);
        assert!(snapshots[0].from_cache);
    }

    let limited_target = added_target_id(&watch.expect_json().await.unwrap());
    send_all(
        &watch,
        &[
            backend.target_change("ADD", &[limited_target], b"", None),
            backend
                .document_change(&key("rooms/a"), version(2), &red(), &[all_target, limited_target], &[])
                .unwrap(),
            backend
                .document_change(&key("rooms/b"), version(1), &red(), &[limited_target], &[])
                .unwrap(),
            backend
                .document_change(&key("rooms/c"), version(1), &red(), &[limited_target], &[])
                .unwrap(),
            backend.target_change("CURRENT", &[limited_target], b"", None),
            backend.global_snapshot(version(2), b"t2"),
        ],
    )
    .await;

    wait_for(&limited, |snapshots| snapshots.iter().any(|snapshot| !snapshot.from_cache)).await;
    let snapshots = limited.lock().unwrap();
    let latest = snapshots.last().unwrap();
    assert_eq!(keys(latest), vec!["rooms/a", "rooms/b"]);
    let changes: Vec<(ChangeType, String)> = latest
        .doc_changes
        .iter()
        .map(|change| (change.change_type, change.document.key().to_string()))
        .collect();
    assert_eq!(
        changes,
        vec![
            (ChangeType::Added, "rooms/a".to_string()),
            (ChangeType::Removed, "rooms/c".to_string()),
        ]
    );
}

#[tokio::test]
async fn bloom_filter_prunes_only_the_missing_document() {
    let fixture = start_client().await;
    let backend = &fixture.backend;
    let (_registration, rooms) = listen(&fixture.client, Query::collection("rooms").unwrap()).await;

    let watch = backend.accept_listen().await.unwrap();
    let target = added_target_id(&watch.expect_json().await.unwrap());
    deliver_current_target(backend, &watch, target, &["rooms/a", "rooms/b", "rooms/c"], 1).await;
    wait_for(&rooms, |snapshots| {
        snapshots
            .last()
            .is_some_and(|latest| !latest.from_cache && latest.docs.len() == 3)
    })
    .await;

    let mut bloom = BloomFilter::new(vec![0; 64], 0, 5).unwrap();
    for path in ["rooms/a", "rooms/c"] {
        bloom.insert(&backend.serializer().document_name(&key(path)));
    }
    send_all(
        &watch,
        &[
            backend.existence_filter(target, 2, Some((bloom.bitmap(), 0, 5))),
            backend.global_snapshot(version(2), b"t2"),
        ],
    )
    .await;

    // The pruned document is checked through its own document target; the
    // query target is not reset.
    let request = watch.expect_json().await.unwrap();
    assert!(request.get("removeTarget").is_none());
    let limbo_target = added_target_id(&request);
    assert_ne!(limbo_target, target);
    assert_eq!(limbo_target % 2, 1);

    send_all(
        &watch,
        &[
            backend.target_change("ADD", &[limbo_target], b"", None),
            backend.target_change("CURRENT", &[limbo_target], b"", None),
            backend.global_snapshot(version(3), b"t3"),
        ],
    )
    .await;
    wait_for(&rooms, |snapshots| {
        snapshots
            .last()
            .is_some_and(|latest| !latest.from_cache && keys(latest) == ["rooms/a", "rooms/c"])
    })
    .await;
}
