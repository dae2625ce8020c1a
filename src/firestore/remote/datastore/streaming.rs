use std::sync::Arc;

use super::{StreamCredentials, StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamOpen};

use futures::FutureExt;

pub(crate) const LISTEN_METHOD: &str = "Listen";
pub(crate) const WRITE_METHOD: &str = "Write";

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// [`StreamingDatastore`] backed by a multiplexed connection.
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }

    fn open(
        &self,
        method: &'static str,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let open = StreamOpen {
                method: method.to_string(),
                auth_token: credentials.auth_token,
                app_check_token: credentials.app_check_token,
            };
            let stream = connection.open_stream(open).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(LISTEN_METHOD, credentials)
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(WRITE_METHOD, credentials)
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn datastore_stream_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left_connection = Arc::new(MultiplexedConnection::new(left_transport));
        let right_connection = Arc::new(MultiplexedConnection::new(right_transport));

        let datastore = StreamingDatastoreImpl::new(Arc::clone(&left_connection));
        let credentials = StreamCredentials {
            auth_token: Some("owner".into()),
            app_check_token: None,
        };
        let handle = datastore
            .open_listen_stream(credentials)
            .await
            .expect("open listen stream");

        let (open, peer_stream) = right_connection
            .accept_stream()
            .await
            .expect("accept peer stream");
        assert_eq!(open.method, LISTEN_METHOD);
        assert_eq!(open.auth_token.as_deref(), Some("owner"));

        peer_stream
            .send(b"hello".to_vec())
            .await
            .expect("send payload");

        let payload = handle
            .next()
            .await
            .expect("receive event")
            .expect("payload");

        assert_eq!(payload, b"hello");
        handle.close().await.expect("close stream");
    }
}
