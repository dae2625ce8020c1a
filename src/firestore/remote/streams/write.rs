use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{
    failed_precondition, internal_error, invalid_argument, FirestoreError, FirestoreResult,
};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamListener};

/// Callbacks of the write stream, invoked on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;

    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    /// Results of the oldest unacknowledged write request.
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

/// The `Write` RPC. After a handshake that yields a stream token, each
/// request carries a batch of writes and the latest token; responses arrive
/// in request order.
#[derive(Clone)]
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(
        layer: &NetworkLayer,
        serializer: JsonProtoSerializer,
        listener: Arc<dyn WriteStreamListener>,
    ) -> Self {
        let state = Arc::new(Mutex::new(WriteStreamState::default()));
        let decoder = Arc::new(WriteResponseDecoder {
            serializer: serializer.clone(),
            state: Arc::clone(&state),
            listener,
        });
        Self {
            stream: layer.write_stream(decoder),
            serializer,
            state,
        }
    }

    pub fn start(&self) {
        lock_state(&self.state).handshake_complete = false;
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

    pub fn handshake_complete(&self) -> bool {
        lock_state(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock_state(&self.state).last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock_state(&self.state).last_stream_token = token;
    }

    /// First request on a fresh stream; the response carries the stream
    /// token.
    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        if self.handshake_complete() {
            return Err(failed_precondition("Handshake already completed"));
        }
        let request = json!({ "database": self.serializer.database_name() });
        self.send(&request).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        if !self.handshake_complete() {
            return Err(failed_precondition(
                "Cannot write mutations before the handshake completes",
            ));
        }
        let writes = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect::<FirestoreResult<Vec<_>>>()?;
        let request = json!({
            "streamToken": self.serializer.encode_bytes(&self.last_stream_token()),
            "writes": writes,
        });
        self.send(&request).await
    }

    async fn send(&self, request: &JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
        self.stream.send(payload).await
    }
}

fn lock_state(state: &Mutex<WriteStreamState>) -> std::sync::MutexGuard<'_, WriteStreamState> {
    state.lock().unwrap_or_else(|poison| poison.into_inner())
}

struct WriteResponseDecoder {
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteStreamState>>,
    listener: Arc<dyn WriteStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener for WriteResponseDecoder {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_write_stream_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| invalid_argument(format!("Invalid write response: {err}")))?;
        let token = self.serializer.decode_bytes(response.get("streamToken"))?;
        if token.is_empty() {
            return Err(invalid_argument("Write response is missing a stream token"));
        }

        let first_response = {
            let mut state = lock_state(&self.state);
            state.last_stream_token = token;
            let first = !state.handshake_complete;
            state.handshake_complete = true;
            first
        };
        if first_response {
            return self.listener.on_handshake_complete().await;
        }

        let commit_version = self
            .serializer
            .decode_optional_version(response.get("commitTime"))?;
        let results = response
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(|result| self.serializer.decode_write_result(result, commit_version))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        self.listener.on_mutation_result(commit_version, results).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_write_stream_close(error).await
    }
}
