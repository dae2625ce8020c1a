use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};

use crate::firestore::error::{
    deadline_exceeded, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::remote::datastore::{RetrySettings, StreamHandle, StreamingDatastore};
use crate::firestore::remote::network::StreamCredentialProvider;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

const LOG_TAG: &str = "PersistentStream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    fn idle_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

/// Lifecycle of a [`PersistentStream`].
///
/// `Initial -> Starting -> Open` on success. Any failure moves to `Error`;
/// the next `start` from `Error` waits in `Backoff` before reconnecting.
/// `stop` returns to `Initial` from every state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    /// Fetching credentials and opening the RPC.
    Starting,
    Open,
    Error,
    Backoff,
}

/// Receives stream events. Every callback runs on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait PersistentStreamListener: Send + Sync + 'static {
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    /// `error` is `None` when the stream was closed deliberately.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// A reconnecting wrapper around one of the backend's bidirectional streams.
///
/// All methods must be called from the async queue. Events of a connection
/// that was closed in the meantime are recognised through a generation
/// counter and dropped.
#[derive(Clone)]
pub struct PersistentStream {
    inner: Arc<PersistentStreamInner>,
}

struct PersistentStreamInner {
    kind: StreamKind,
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    queue: AsyncQueue,
    settings: RetrySettings,
    listener: Arc<dyn PersistentStreamListener>,
    slot: Mutex<StreamSlot>,
}

struct StreamSlot {
    state: PersistentStreamState,
    backoff: ExponentialBackoff,
    stream: Option<Arc<dyn StreamHandle>>,
    generation: u64,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
    last_close_unauthenticated: bool,
}

impl PersistentStream {
    pub(crate) fn new(
        kind: StreamKind,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
        queue: AsyncQueue,
        settings: RetrySettings,
        listener: Arc<dyn PersistentStreamListener>,
    ) -> Self {
        let backoff = ExponentialBackoff::new(settings.backoff);
        Self {
            inner: Arc::new(PersistentStreamInner {
                kind,
                datastore,
                credentials,
                queue,
                settings,
                listener,
                slot: Mutex::new(StreamSlot {
                    state: PersistentStreamState::Initial,
                    backoff,
                    stream: None,
                    generation: 0,
                    idle_timer: None,
                    backoff_timer: None,
                    last_close_unauthenticated: false,
                }),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock_slot().state
    }

    /// Starting, open or waiting to reconnect. A started stream reports
    /// `on_open` or `on_close` eventually.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Open
                | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    /// Opens the stream. Calling `start` after a failure reconnects after a
    /// backoff delay.
    pub fn start(&self) {
        let generation = {
            let mut slot = self.lock_slot();
            match slot.state {
                PersistentStreamState::Error => {
                    self.perform_backoff(&mut slot);
                    return;
                }
                PersistentStreamState::Initial => {}
                state => {
                    debug!("[{LOG_TAG}] {:?} stream already started ({state:?})", self.inner.kind);
                    return;
                }
            }
            slot.state = PersistentStreamState::Starting;
            slot.generation
        };

        let stream = self.clone();
        runtime::spawn_detached(async move {
            let result = stream.connect().await;
            let on_queue = stream.clone();
            stream.inner.queue.enqueue_and_forget(async move {
                on_queue.handle_connect_result(generation, result).await
            });
        });
    }

    /// Closes the stream without an error and resets the backoff.
    pub async fn stop(&self) -> FirestoreResult<()> {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await?;
        }
        Ok(())
    }

    /// Skips the backoff before the next `start`, used after errors that are
    /// not caused by the connection.
    pub fn inhibit_backoff(&self) {
        let mut slot = self.lock_slot();
        if matches!(
            slot.state,
            PersistentStreamState::Starting
                | PersistentStreamState::Open
                | PersistentStreamState::Backoff
        ) {
            warn!("[{LOG_TAG}] Cannot inhibit backoff of a started stream");
            return;
        }
        slot.state = PersistentStreamState::Initial;
        slot.backoff.reset();
    }

    /// Closes the stream after the idle timeout unless it is used again
    /// before then.
    pub fn mark_idle(&self) {
        let mut slot = self.lock_slot();
        if slot.state != PersistentStreamState::Open || slot.idle_timer.is_some() {
            return;
        }
        let stream = self.clone();
        slot.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.kind.idle_timer(),
            self.inner.settings.idle_timeout,
            move || async move { stream.handle_idleness().await },
        ));
    }

    /// Sends one request on the open stream and cancels a pending idle close.
    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let stream = {
            let mut slot = self.lock_slot();
            if let Some(timer) = slot.idle_timer.take() {
                timer.cancel();
            }
            slot.stream.clone()
        };
        match stream {
            Some(stream) => stream.send(payload).await,
            None => Err(unavailable("Stream is not open")),
        }
    }

    async fn connect(&self) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let settings = &self.inner.settings;
        let credentials = runtime::timeout(settings.credentials_timeout, self.inner.credentials.fetch())
            .await
            .ok_or_else(|| deadline_exceeded("Timed out fetching credentials"))??;

        let open = async {
            match self.inner.kind {
                StreamKind::Listen => self.inner.datastore.open_listen_stream(credentials).await,
                StreamKind::Write => self.inner.datastore.open_write_stream(credentials).await,
            }
        };
        runtime::timeout(settings.open_timeout, open)
            .await
            .ok_or_else(|| deadline_exceeded("Timed out opening stream"))?
    }

    async fn handle_connect_result(
        &self,
        generation: u64,
        result: FirestoreResult<Arc<dyn StreamHandle>>,
    ) -> FirestoreResult<()> {
        let stale = {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                true
            } else {
                if let Ok(stream) = &result {
                    slot.state = PersistentStreamState::Open;
                    slot.stream = Some(Arc::clone(stream));
                }
                false
            }
        };
        if stale {
            // Stopped while connecting.
            if let Ok(stream) = result {
                if let Err(err) = stream.close().await {
                    debug!("[{LOG_TAG}] Failed to close stale {:?} stream: {err}", self.inner.kind);
                }
            }
            return Ok(());
        }

        match result {
            Ok(stream) => {
                debug!("[{LOG_TAG}] {:?} stream opened", self.inner.kind);
                self.spawn_reader(generation, stream);
                if let Err(err) = self.inner.listener.on_open().await {
                    warn!("[{LOG_TAG}] {:?} stream open handler failed: {err}", self.inner.kind);
                    self.close(PersistentStreamState::Error, Some(err)).await?;
                }
                Ok(())
            }
            Err(err) => {
                debug!("[{LOG_TAG}] {:?} stream failed to open: {err}", self.inner.kind);
                self.close(PersistentStreamState::Error, Some(err)).await
            }
        }
    }

    fn spawn_reader(&self, generation: u64, handle: Arc<dyn StreamHandle>) {
        let stream = self.clone();
        runtime::spawn_detached(async move {
            loop {
                let event = handle.next().await;
                let on_queue = stream.clone();
                match event {
                    Some(Ok(payload)) => {
                        stream.inner.queue.enqueue_and_forget(async move {
                            on_queue.handle_message(generation, payload).await
                        });
                    }
                    Some(Err(err)) => {
                        stream.inner.queue.enqueue_and_forget(async move {
                            on_queue.handle_stream_close(generation, err).await
                        });
                        break;
                    }
                    None => {
                        let err = unavailable("Stream closed by the backend");
                        stream.inner.queue.enqueue_and_forget(async move {
                            on_queue.handle_stream_close(generation, err).await
                        });
                        break;
                    }
                }
            }
        });
    }

    async fn handle_message(&self, generation: u64, payload: Vec<u8>) -> FirestoreResult<()> {
        {
            let mut slot = self.lock_slot();
            if slot.generation != generation {
                return Ok(());
            }
            // A response proves the connection healthy.
            slot.backoff.reset();
            slot.last_close_unauthenticated = false;
        }
        if let Err(err) = self.inner.listener.on_message(payload).await {
            warn!("[{LOG_TAG}] {:?} stream message handler failed: {err}", self.inner.kind);
            self.close(PersistentStreamState::Error, Some(err)).await?;
        }
        Ok(())
    }

    async fn handle_stream_close(&self, generation: u64, error: FirestoreError) -> FirestoreResult<()> {
        if self.lock_slot().generation != generation {
            return Ok(());
        }
        debug!("[{LOG_TAG}] {:?} stream closed: {error}", self.inner.kind);
        self.close(PersistentStreamState::Error, Some(error)).await
    }

    async fn handle_idleness(&self) -> FirestoreResult<()> {
        {
            let mut slot = self.lock_slot();
            slot.idle_timer = None;
            if slot.state != PersistentStreamState::Open {
                return Ok(());
            }
        }
        debug!("[{LOG_TAG}] {:?} stream idle, closing", self.inner.kind);
        self.close(PersistentStreamState::Initial, None).await
    }

    async fn close(
        &self,
        final_state: PersistentStreamState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let stream = {
            let mut slot = self.lock_slot();
            if let Some(timer) = slot.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = slot.backoff_timer.take() {
                timer.cancel();
            }

            let code = error.as_ref().map(|error| error.code);
            if final_state != PersistentStreamState::Error {
                slot.backoff.reset();
            } else if code == Some(FirestoreErrorCode::ResourceExhausted) {
                warn!("[{LOG_TAG}] Backend quota exhausted, backing off to the maximum delay");
                slot.backoff.reset_to_max();
            } else if code == Some(FirestoreErrorCode::Unauthenticated) {
                // The token was rejected: fetch a fresh one, and back off
                // fully if the fresh one was rejected too.
                self.inner.credentials.invalidate();
                if slot.last_close_unauthenticated {
                    slot.backoff.reset_to_max();
                }
            }
            slot.last_close_unauthenticated = code == Some(FirestoreErrorCode::Unauthenticated);

            slot.generation += 1;
            slot.state = final_state;
            slot.stream.take()
        };

        if let Some(stream) = stream {
            if let Err(err) = stream.close().await {
                debug!("[{LOG_TAG}] Failed to close stream: {err}");
            }
        }

        self.inner.listener.on_close(error).await
    }

    fn perform_backoff(&self, slot: &mut StreamSlot) {
        slot.state = PersistentStreamState::Backoff;
        let delay = slot.backoff.next_delay();
        debug!("[{LOG_TAG}] {:?} stream reconnecting in {delay:?}", self.inner.kind);
        let stream = self.clone();
        slot.backoff_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.kind.backoff_timer(),
            delay,
            move || async move {
                {
                    let mut slot = stream.lock_slot();
                    slot.backoff_timer = None;
                    if slot.state != PersistentStreamState::Backoff {
                        return Ok(());
                    }
                    slot.state = PersistentStreamState::Initial;
                }
                stream.start();
                Ok(())
            },
        ));
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, StreamSlot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
