use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};

use super::streaming::{StreamingDatastoreImpl, LISTEN_METHOD, WRITE_METHOD};
use crate::firestore::core::types::TargetId;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DatabaseId, DocumentKey, SnapshotVersion};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamOpen, StreamTransport,
};
use crate::firestore::value::MapValue;

/// Backend end of an in-memory transport. Tests accept the client's streams
/// and script the responses.
pub struct InMemoryBackend {
    connection: Arc<MultiplexedConnection>,
    transport: Arc<InMemoryTransport>,
    serializer: JsonProtoSerializer,
    pending: Mutex<Vec<ServerStream>>,
}

impl InMemoryBackend {
    /// Creates a backend together with the datastore clients use to reach it.
    pub fn pair(database_id: DatabaseId) -> (Self, StreamingDatastoreImpl) {
        let (client_transport, backend_transport) = InMemoryTransport::pair();
        let client_connection = Arc::new(MultiplexedConnection::new(client_transport));
        let backend = Self {
            connection: Arc::new(MultiplexedConnection::new(
                Arc::clone(&backend_transport) as Arc<dyn StreamTransport>
            )),
            transport: backend_transport,
            serializer: JsonProtoSerializer::new(database_id),
            pending: Mutex::new(Vec::new()),
        };
        (backend, StreamingDatastoreImpl::new(client_connection))
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub async fn accept_listen(&self) -> FirestoreResult<ServerStream> {
        self.accept_method(LISTEN_METHOD).await
    }

    pub async fn accept_write(&self) -> FirestoreResult<ServerStream> {
        self.accept_method(WRITE_METHOD).await
    }

    /// Waits for the next stream opened for `method`. Streams for other
    /// methods are kept for later calls.
    pub async fn accept_method(&self, method: &str) -> FirestoreResult<ServerStream> {
        {
            let mut pending = self.lock_pending();
            if let Some(index) = pending.iter().position(|stream| stream.method() == method) {
                return Ok(pending.remove(index));
            }
        }
        loop {
            let (open, stream) = self.connection.accept_stream().await?;
            let stream = ServerStream { open, stream };
            if stream.method() == method {
                return Ok(stream);
            }
            self.lock_pending().push(stream);
        }
    }

    /// Severs the connection; every open stream fails with `Unavailable`.
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn target_change(
        &self,
        change_type: &str,
        target_ids: &[TargetId],
        resume_token: &[u8],
        read_time: Option<SnapshotVersion>,
    ) -> JsonValue {
        let mut change = json!({
            "targetChangeType": change_type,
            "targetIds": target_ids,
        });
        if !resume_token.is_empty() {
            change["resumeToken"] = json!(self.serializer.encode_bytes(resume_token));
        }
        if let Some(read_time) = read_time {
            change["readTime"] = json!(self.serializer.encode_version(&read_time));
        }
        json!({ "targetChange": change })
    }

    /// Global `NO_CHANGE` that establishes a consistent snapshot at `version`.
    pub fn global_snapshot(&self, version: SnapshotVersion, resume_token: &[u8]) -> JsonValue {
        self.target_change("NO_CHANGE", &[], resume_token, Some(version))
    }

    pub fn document_change(
        &self,
        key: &DocumentKey,
        version: SnapshotVersion,
        fields: &MapValue,
        target_ids: &[TargetId],
        removed_target_ids: &[TargetId],
    ) -> FirestoreResult<JsonValue> {
        let timestamp = self.serializer.encode_version(&version);
        Ok(json!({
            "documentChange": {
                "document": {
                    "name": self.serializer.document_name(key),
                    "fields": self.serializer.encode_fields(fields)?,
                    "createTime": timestamp,
                    "updateTime": timestamp,
                },
                "targetIds": target_ids,
                "removedTargetIds": removed_target_ids,
            }
        }))
    }

    pub fn document_delete(
        &self,
        key: &DocumentKey,
        read_time: SnapshotVersion,
        removed_target_ids: &[TargetId],
    ) -> JsonValue {
        json!({
            "documentDelete": {
                "document": self.serializer.document_name(key),
                "readTime": self.serializer.encode_version(&read_time),
                "removedTargetIds": removed_target_ids,
            }
        })
    }

    pub fn existence_filter(
        &self,
        target_id: TargetId,
        count: i32,
        bloom_filter: Option<(&[u8], u32, u32)>,
    ) -> JsonValue {
        let mut filter = json!({ "targetId": target_id, "count": count });
        if let Some((bitmap, padding, hash_count)) = bloom_filter {
            filter["unchangedNames"] = json!({
                "bits": {
                    "bitmap": self.serializer.encode_bytes(bitmap),
                    "padding": padding,
                },
                "hashCount": hash_count,
            });
        }
        json!({ "filter": filter })
    }

    /// Response to a write request; `update_times` holds one entry per write.
    pub fn write_response(
        &self,
        stream_token: &[u8],
        commit_version: SnapshotVersion,
        update_times: &[SnapshotVersion],
    ) -> JsonValue {
        let results: Vec<JsonValue> = update_times
            .iter()
            .map(|version| json!({ "updateTime": self.serializer.encode_version(version) }))
            .collect();
        json!({
            "streamToken": self.serializer.encode_bytes(stream_token),
            "commitTime": self.serializer.encode_version(&commit_version),
            "writeResults": results,
        })
    }

    pub fn handshake_response(&self, stream_token: &[u8]) -> JsonValue {
        json!({ "streamToken": self.serializer.encode_bytes(stream_token) })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<ServerStream>> {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// A client stream as seen by the backend.
pub struct ServerStream {
    open: StreamOpen,
    stream: MultiplexedStream,
}

impl ServerStream {
    pub fn method(&self) -> &str {
        &self.open.method
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.open.auth_token.as_deref()
    }

    /// Next client request decoded as JSON. `None` once the client closed
    /// the stream.
    pub async fn next_json(&self) -> Option<FirestoreResult<JsonValue>> {
        let payload = match self.stream.next().await? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err)),
        };
        Some(
            serde_json::from_slice(&payload)
                .map_err(|err| invalid_argument(format!("Client sent invalid JSON: {err}"))),
        )
    }

    /// Like [`next_json`](Self::next_json) but treats a closed stream as an
    /// error.
    pub async fn expect_json(&self) -> FirestoreResult<JsonValue> {
        self.next_json()
            .await
            .unwrap_or_else(|| Err(internal_error("Client closed the stream")))
    }

    pub async fn send_json(&self, value: &JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| internal_error(format!("Failed to encode response: {err}")))?;
        self.stream.send(payload).await
    }

    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.stream.fail(error).await
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.stream.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use crate::firestore::remote::datastore::{StreamCredentials, StreamingDatastore};

    #[tokio::test]
    async fn routes_streams_by_method() {
        let (backend, datastore) = InMemoryBackend::pair(DatabaseId::new("p", "(default)"));
        let write = datastore
            .open_write_stream(StreamCredentials::default())
            .await
            .unwrap();
        let listen = datastore
            .open_listen_stream(StreamCredentials::default())
            .await
            .unwrap();

        let server_listen = backend.accept_listen().await.unwrap();
        let server_write = backend.accept_write().await.unwrap();
        assert_eq!(server_listen.method(), "Listen");
        assert_eq!(server_write.method(), "Write");

        write.send(br#"{"database":"x"}"#.to_vec()).await.unwrap();
        let request = server_write.expect_json().await.unwrap();
        assert_eq!(request["database"], json!("x"));

        let response = backend.global_snapshot(SnapshotVersion::new(Timestamp::new(3, 0)), b"t");
        server_listen.send_json(&response).await.unwrap();
        let payload = listen.next().await.unwrap().unwrap();
        let decoded: JsonValue = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, response);
    }
}
