use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::types::TargetId;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamListener};
use crate::firestore::remote::watch_change::{
    decode_watch_change, snapshot_version_from_response, WatchChange,
};

/// Callbacks of the listen stream, invoked on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is non-minimal only for responses that mark a
    /// consistent snapshot across all targets.
    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The `Listen` RPC: adds and removes targets and decodes watch changes.
#[derive(Clone)]
pub struct ListenStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

impl ListenStream {
    pub fn new(
        layer: &NetworkLayer,
        serializer: JsonProtoSerializer,
        listener: Arc<dyn WatchStreamListener>,
    ) -> Self {
        let decoder = Arc::new(ListenResponseDecoder {
            serializer: serializer.clone(),
            listener,
        });
        Self {
            stream: layer.listen_stream(decoder),
            serializer,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) -> FirestoreResult<()> {
        self.stream.stop().await
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Starts watching `target_data`, resuming from its token or version
    /// when it has one.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let mut request = json!({
            "database": self.serializer.database_name(),
            "addTarget": self.serializer.encode_listen_target(target_data)?,
        });
        if let Some(labels) = self.serializer.encode_listen_request_labels(target_data) {
            request["labels"] = json!(labels);
        }
        self.send(&request).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.send(&request).await
    }

    async fn send(&self, request: &JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        self.stream.send(payload).await
    }
}

struct ListenResponseDecoder {
    serializer: JsonProtoSerializer,
    listener: Arc<dyn WatchStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener for ListenResponseDecoder {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_watch_stream_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| invalid_argument(format!("Invalid listen response: {err}")))?;
        let Some(change) = decode_watch_change(&self.serializer, &response)? else {
            log::debug!("Ignoring unknown listen response: {response}");
            return Ok(());
        };
        let snapshot_version = snapshot_version_from_response(&self.serializer, &response)?;
        self.listener.on_watch_change(change, snapshot_version).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_watch_stream_close(error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::remote::datastore::{InMemoryBackend, NoopTokenProvider};
    use crate::firestore::remote::watch_change::WatchTargetChangeState;
    use crate::platform::runtime;
    use crate::util::async_queue::AsyncQueue;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        opened: Mutex<bool>,
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
    }

    #[async_trait]
    impl WatchStreamListener for Recorder {
        async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
            *self.opened.lock().unwrap() = true;
            Ok(())
        }

        async fn on_watch_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> FirestoreResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_stream_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sends_targets_and_decodes_changes() {
        let database_id = DatabaseId::new("p", "(default)");
        let (backend, datastore) = InMemoryBackend::pair(database_id.clone());
        let queue = AsyncQueue::new();
        let layer = NetworkLayer::builder(Arc::new(datastore), Arc::new(NoopTokenProvider))
            .build(queue.clone());
        let recorder = Arc::new(Recorder::default());
        let stream = ListenStream::new(
            &layer,
            JsonProtoSerializer::new(database_id),
            Arc::clone(&recorder) as Arc<dyn WatchStreamListener>,
        );

        let starter = stream.clone();
        queue
            .enqueue(async move {
                starter.start();
                Ok(())
            })
            .await
            .unwrap();
        let server = backend.accept_listen().await.unwrap();
        for _ in 0..50 {
            if *recorder.opened.lock().unwrap() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }

        let target = Query::collection("rooms").unwrap().to_target();
        let target_data = TargetData::new(target, 4, TargetPurpose::LimboResolution, 1);
        let watcher = stream.clone();
        queue
            .enqueue(async move { watcher.watch(&target_data).await })
            .await
            .unwrap();
        let request = server.expect_json().await.unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(4));
        assert_eq!(request["labels"]["goog-listen-tags"], json!("limbo-document"));
        assert_eq!(
            request["database"],
            json!("projects/p/databases/(default)")
        );

        let version = SnapshotVersion::new(Timestamp::new(9, 0));
        server
            .send_json(&backend.global_snapshot(version, b"token"))
            .await
            .unwrap();
        for _ in 0..50 {
            if !recorder.changes.lock().unwrap().is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        let changes = recorder.changes.lock().unwrap();
        let (change, snapshot_version) = &changes[0];
        assert_eq!(*snapshot_version, version);
        match change {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.state, WatchTargetChangeState::NoChange);
                assert_eq!(change.resume_token, b"token".to_vec());
            }
            other => panic!("unexpected change {other:?}"),
        }
    }
}
