use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(not(target_arch = "wasm32"))]
use futures::future::BoxFuture;
#[cfg(target_arch = "wasm32")]
use futures::future::LocalBoxFuture;

use crate::firestore::error::FirestoreResult;
use crate::util::backoff::BackoffConfig;

pub mod in_memory;
pub mod streaming;

pub use in_memory::{InMemoryBackend, ServerStream};
pub use streaming::StreamingDatastoreImpl;

#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = LocalBoxFuture<'a, T>;

/// Credentials attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// One open bidirectional RPC.
pub trait StreamHandle: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// `None` when the backend closed the stream without an error.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the backend's `Listen` and `Write` streams.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    /// Authenticated user; `None` for unauthenticated access.
    pub uid: Option<String>,
}

/// Called with the new user id whenever the signed-in user changes. The
/// empty string stands for the unauthenticated user.
pub type CredentialChangeListener = Arc<dyn Fn(String) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);

    fn set_change_listener(&self, _listener: CredentialChangeListener) {}
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Reconnect and timeout behaviour of the persistent streams.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub backoff: BackoffConfig,
    /// An open stream with no outstanding work is closed after this long.
    pub idle_timeout: Duration,
    pub credentials_timeout: Duration,
    pub open_timeout: Duration,
    /// A watch stream that produced nothing for this long reports the client
    /// offline.
    pub online_state_timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            idle_timeout: Duration::from_secs(60),
            credentials_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            online_state_timeout: Duration::from_secs(10),
        }
    }
}

impl RetrySettings {
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }
}
