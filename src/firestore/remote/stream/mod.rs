pub mod persistent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub use persistent::{
    PersistentStream, PersistentStreamListener, PersistentStreamState, StreamKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Header of a stream opened by either side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOpen {
    /// RPC method, e.g. `"Listen"`.
    pub method: String,
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

impl StreamOpen {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            auth_token: None,
            app_check_token: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamOpen),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, open: StreamOpen) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(open),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Many logical streams over one transport. Either side may open streams;
/// streams opened by the peer are handed out by [`accept_stream`].
///
/// [`accept_stream`]: MultiplexedConnection::accept_stream
pub struct MultiplexedConnection {
    transport: Arc<dyn StreamTransport>,
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted_rx: Receiver<(StreamOpen, MultiplexedStream)>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            transport: Arc::clone(&transport),
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted_rx,
        };

        manager.start_outbound_loop(outbound_rx);
        manager.start_inbound_loop(accepted_tx);
        manager
    }

    fn start_outbound_loop(&self, outbound_rx: Receiver<TransportFrame>) {
        let transport = Arc::clone(&self.transport);
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err:?}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(&self, accepted_tx: Sender<(StreamOpen, MultiplexedStream)>) {
        let transport = Arc::clone(&self.transport);
        let streams = Arc::clone(&self.streams);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err:?}");
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let event = frame.kind().clone();

                if let FrameKind::Open(open) = event {
                    let (inbound_tx, inbound_rx) = async_channel::unbounded();
                    lock_streams(&streams).insert(stream_id, inbound_tx);
                    let stream = MultiplexedStream {
                        id: stream_id,
                        outbound: handle.outbound_tx.clone(),
                        inbound: inbound_rx,
                        manager: handle.clone(),
                    };
                    if accepted_tx.send((open, stream)).await.is_err() {
                        log::debug!("dropping incoming stream {}", stream_id.value());
                    }
                    continue;
                }

                let maybe_sender = lock_streams(&streams).get(&stream_id).cloned();
                let Some(sender) = maybe_sender else {
                    log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    continue;
                };
                let terminal = matches!(event, FrameKind::Close | FrameKind::Error(_));
                if let Err(err) = sender.send(event).await {
                    log::debug!(
                        "dropping inbound frame for closed stream {}: {:?}",
                        stream_id.value(),
                        err
                    );
                }
                if terminal {
                    lock_streams(&streams).remove(&stream_id);
                }
            }

            // Wake every stream still waiting on the dead transport.
            let senders: Vec<_> = lock_streams(&streams).drain().map(|(_, sender)| sender).collect();
            for sender in senders {
                let _ = sender
                    .send(FrameKind::Error(unavailable("Connection to the backend was lost")))
                    .await;
            }
        });
    }

    pub async fn open_stream(&self, open: StreamOpen) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock_streams(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, open))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> FirestoreResult<(StreamOpen, MultiplexedStream)> {
        self.accepted_rx
            .recv()
            .await
            .map_err(|_| unavailable("Connection closed while waiting for a stream"))
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

fn lock_streams(
    streams: &StreamRegistry,
) -> std::sync::MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    pub fn close_stream(&self, stream_id: StreamId) {
        // Only a stream this side still tracks needs a close frame.
        if lock_streams(&self.streams).remove(&stream_id).is_some() {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    /// `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.manager.close_stream(self.id);
        Ok(())
    }

    /// Terminates the stream with `error`, which the peer receives from
    /// [`next`](Self::next).
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        lock_streams(&self.manager.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Drops both directions; every stream on either side sees the
    /// connection fail.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left
            .open_stream(StreamOpen::new("Listen"))
            .await
            .expect("left stream");
        let (open, right_stream) = right.accept_stream().await.expect("accepted stream");
        assert_eq!(open.method, "Listen");
        assert_eq!(right_stream.id(), left_stream.id());

        left_stream
            .send(b"hello".to_vec())
            .await
            .expect("left send");
        let payload = right_stream
            .next()
            .await
            .expect("right recv")
            .expect("payload");
        assert_eq!(payload, b"hello");

        right_stream
            .send(b"world".to_vec())
            .await
            .expect("right send");
        let payload = left_stream
            .next()
            .await
            .expect("left recv")
            .expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream(StreamOpen::new("Write")).await.expect("left stream");
        let (_, right_stream) = right.accept_stream().await.expect("accepted stream");

        left_stream.close().await.expect("left close");
        assert!(right_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failing_stream_delivers_error() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let client = left
            .open_stream(StreamOpen::new("Listen"))
            .await
            .expect("client stream");
        let (_, server) = right.accept_stream().await.expect("accepted stream");
        server
            .fail(permission_denied("denied"))
            .await
            .expect("send error");

        let error = client.next().await.expect("event").unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
    }
}
