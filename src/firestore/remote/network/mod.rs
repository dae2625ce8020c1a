use std::sync::Arc;

use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::datastore::{
    CredentialChangeListener, NoopTokenProvider, RetrySettings, StreamCredentials,
    StreamingDatastore, TokenProviderArc,
};
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamListener, StreamKind};
use crate::util::async_queue::AsyncQueue;

/// Auth and App Check token sources shared by both streams.
#[derive(Clone)]
pub(crate) struct StreamCredentialProvider {
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
}

impl StreamCredentialProvider {
    pub(crate) fn new(auth_provider: TokenProviderArc, app_check_provider: TokenProviderArc) -> Self {
        Self {
            auth_provider,
            app_check_provider,
        }
    }

    pub(crate) async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let auth_token = self.auth_provider.get_token(false).await?;
        let app_check_token = self.app_check_provider.get_token(false).await?;
        Ok(StreamCredentials {
            auth_token: auth_token.map(|token| token.value),
            app_check_token: app_check_token.map(|token| token.value),
        })
    }

    pub(crate) fn invalidate(&self) {
        self.auth_provider.invalidate_token();
        self.app_check_provider.invalidate_token();
    }
}

/// Creates the persistent streams for one client.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    auth_provider: TokenProviderArc,
    retry: RetrySettings,
    queue: AsyncQueue,
}

impl NetworkLayer {
    pub fn builder(
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
    ) -> NetworkLayerBuilder {
        NetworkLayerBuilder::new(datastore, auth_provider)
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.retry
    }

    /// Forwards user changes reported by the auth provider.
    pub fn set_credential_change_listener(&self, listener: CredentialChangeListener) {
        self.auth_provider.set_change_listener(listener);
    }

    pub(crate) fn listen_stream(&self, listener: Arc<dyn PersistentStreamListener>) -> PersistentStream {
        self.stream(StreamKind::Listen, listener)
    }

    pub(crate) fn write_stream(&self, listener: Arc<dyn PersistentStreamListener>) -> PersistentStream {
        self.stream(StreamKind::Write, listener)
    }

    fn stream(&self, kind: StreamKind, listener: Arc<dyn PersistentStreamListener>) -> PersistentStream {
        PersistentStream::new(
            kind,
            Arc::clone(&self.datastore),
            self.credentials.clone(),
            self.queue.clone(),
            self.retry.clone(),
            listener,
        )
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: TokenProviderArc,
    app_check_provider: Option<TokenProviderArc>,
    retry: RetrySettings,
}

impl NetworkLayerBuilder {
    fn new(datastore: Arc<dyn StreamingDatastore>, auth_provider: TokenProviderArc) -> Self {
        Self {
            datastore,
            auth_provider,
            app_check_provider: None,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self, queue: AsyncQueue) -> NetworkLayer {
        let app_check = self
            .app_check_provider
            .unwrap_or_else(|| Arc::new(NoopTokenProvider) as TokenProviderArc);
        let credentials = StreamCredentialProvider::new(Arc::clone(&self.auth_provider), app_check);
        NetworkLayer {
            datastore: self.datastore,
            credentials,
            auth_provider: self.auth_provider,
            retry: self.retry,
            queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreError;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::{InMemoryBackend, Token, TokenProvider};
    use async_trait::async_trait;

    struct StaticTokenProvider {
        token: &'static str,
    }

    #[async_trait]
    impl TokenProvider for StaticTokenProvider {
        async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
            Ok(Some(Token {
                value: self.token.to_string(),
                uid: None,
            }))
        }

        fn invalidate_token(&self) {}
    }

    struct IgnoringListener;

    #[async_trait]
    impl PersistentStreamListener for IgnoringListener {
        async fn on_open(&self) -> FirestoreResult<()> {
            Ok(())
        }

        async fn on_message(&self, _payload: Vec<u8>) -> FirestoreResult<()> {
            Ok(())
        }

        async fn on_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn streams_carry_both_tokens() {
        let (backend, datastore) = InMemoryBackend::pair(DatabaseId::new("p", "(default)"));
        let queue = AsyncQueue::new();
        let layer = NetworkLayer::builder(
            Arc::new(datastore),
            Arc::new(StaticTokenProvider { token: "auth" }),
        )
        .with_app_check_provider(Arc::new(StaticTokenProvider { token: "app-check" }))
        .build(queue.clone());

        let stream = layer.write_stream(Arc::new(IgnoringListener));
        assert_eq!(stream.kind(), StreamKind::Write);
        let starter = stream.clone();
        queue
            .enqueue(async move {
                starter.start();
                Ok(())
            })
            .await
            .unwrap();

        let server = backend.accept_write().await.unwrap();
        assert_eq!(server.auth_token(), Some("auth"));
    }
}
