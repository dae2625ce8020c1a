use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};

use crate::firestore::core::event_manager::{EventManager, ListenOptions, SnapshotCallback};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineSettings};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view::{View, ViewSnapshot};
use crate::firestore::error::{cancelled, unavailable, FirestoreResult};
use crate::firestore::local::index_backfiller::{IndexBackfiller, IndexBackfillerScheduler};
use crate::firestore::local::lease::LEASE_REFRESH_INTERVAL_MS;
use crate::firestore::local::local_store::{LocalStore, LocalStoreConfig};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruScheduler};
use crate::firestore::local::persistence::MemoryPersistence;
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::datastore::{RetrySettings, StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_event::TargetChange;
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "FirestoreClient";

const DEFAULT_MAX_DOCUMENTS_TO_BACKFILL: usize = 50;

/// Tuning of every component a [`FirestoreClient`] builds.
#[derive(Clone, Debug)]
pub struct FirestoreClientSettings {
    pub local_store: LocalStoreConfig,
    pub lru: LruParams,
    pub retry: RetrySettings,
    pub sync_engine: SyncEngineSettings,
    /// Documents indexed per backfill run.
    pub max_documents_to_backfill: usize,
}

impl Default for FirestoreClientSettings {
    fn default() -> Self {
        Self {
            local_store: LocalStoreConfig::default(),
            lru: LruParams::default(),
            retry: RetrySettings::default(),
            sync_engine: SyncEngineSettings::default(),
            max_documents_to_backfill: DEFAULT_MAX_DOCUMENTS_TO_BACKFILL,
        }
    }
}

impl FirestoreClientSettings {
    pub fn with_local_store(mut self, config: LocalStoreConfig) -> Self {
        self.local_store = config;
        self
    }

    pub fn with_lru(mut self, params: LruParams) -> Self {
        self.lru = params;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sync_engine(mut self, settings: SyncEngineSettings) -> Self {
        self.sync_engine = settings;
        self
    }

    pub fn with_max_documents_to_backfill(mut self, max_documents: usize) -> Self {
        self.max_documents_to_backfill = max_documents;
        self
    }
}

/// External collaborators of a client.
pub struct FirestoreClientComponents {
    pub database_id: DatabaseId,
    pub datastore: Arc<dyn StreamingDatastore>,
    pub auth_provider: TokenProviderArc,
    pub app_check_provider: Option<TokenProviderArc>,
    /// Started by the client. Use [`MemoryPersistence::share`] to run several
    /// clients over one cache.
    pub persistence: MemoryPersistence,
}

/// Entry point of the engine: owns the async queue and runs every
/// operation on it, so no two operations interleave.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<FirestoreClientInner>,
}

struct FirestoreClientInner {
    queue: AsyncQueue,
    local_store: LocalStore,
    remote_store: RemoteStore,
    sync_engine: SyncEngine,
    event_manager: EventManager,
    lru_scheduler: LruScheduler,
    backfill_scheduler: IndexBackfillerScheduler,
    lease_refresh: Arc<Mutex<Option<DelayedOperation>>>,
}

impl FirestoreClient {
    /// Starts persistence, wires the local and remote stores and enables the
    /// network.
    pub async fn start(
        components: FirestoreClientComponents,
        settings: FirestoreClientSettings,
    ) -> FirestoreResult<Self> {
        let FirestoreClientComponents {
            database_id,
            datastore,
            auth_provider,
            app_check_provider,
            persistence,
        } = components;

        let queue = AsyncQueue::new();
        let user_id = auth_provider
            .get_token(false)
            .await?
            .and_then(|token| token.uid)
            .unwrap_or_default();
        let is_primary = persistence.start().await?;
        debug!(
            "[{LOG_TAG}] Starting client {} as user {user_id:?} (primary: {is_primary})",
            persistence.client_id()
        );

        let local_store = LocalStore::new(persistence, &user_id, settings.local_store.clone());
        let mut builder = NetworkLayer::builder(datastore, auth_provider).with_retry(settings.retry.clone());
        if let Some(provider) = app_check_provider {
            builder = builder.with_app_check_provider(provider);
        }
        let network_layer = builder.build(queue.clone());

        let sync_engine = SyncEngine::new(
            local_store.clone(),
            &network_layer,
            JsonProtoSerializer::new(database_id),
            user_id,
            settings.sync_engine.clone(),
        );
        let remote_store = sync_engine.remote_store().clone();
        let event_manager = EventManager::new(sync_engine.clone());
        let lru_scheduler = LruScheduler::new(
            LruGarbageCollector::new(local_store.reference_delegate().clone(), settings.lru.clone()),
            local_store.clone(),
            queue.clone(),
        );
        let backfill_scheduler = IndexBackfillerScheduler::new(
            IndexBackfiller::new(settings.max_documents_to_backfill),
            local_store.clone(),
            queue.clone(),
        );

        let client = Self {
            inner: Arc::new(FirestoreClientInner {
                queue: queue.clone(),
                local_store,
                remote_store: remote_store.clone(),
                sync_engine,
                event_manager,
                lru_scheduler,
                backfill_scheduler,
                lease_refresh: Arc::new(Mutex::new(None)),
            }),
        };

        let starting = remote_store.clone();
        queue.enqueue(async move { starting.start().await }).await?;

        let credential_queue = queue.clone();
        let credential_store = remote_store.clone();
        network_layer.set_credential_change_listener(Arc::new(move |user_id: String| {
            let remote_store = credential_store.clone();
            credential_queue.enqueue_and_forget(async move {
                remote_store.handle_credential_change(user_id).await
            });
        }));

        let primary_queue = queue.clone();
        let lru_scheduler = client.inner.lru_scheduler.clone();
        let backfill_scheduler = client.inner.backfill_scheduler.clone();
        client
            .inner
            .local_store
            .persistence()
            .set_primary_state_listener(move |is_primary| {
                // Only the primary client collects garbage and backfills.
                if is_primary {
                    lru_scheduler.start();
                    backfill_scheduler.start();
                } else {
                    lru_scheduler.stop();
                    backfill_scheduler.stop();
                }
                let remote_store = remote_store.clone();
                primary_queue.enqueue_and_forget(async move {
                    remote_store.apply_primary_state(is_primary).await
                });
            });

        schedule_lease_refresh(
            queue,
            client.inner.local_store.clone(),
            Arc::clone(&client.inner.lease_refresh),
        );
        Ok(client)
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync_engine
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.inner.local_store
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.remote_store.online_state()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.queue.is_shutting_down()
    }

    /// Registers `callback` for the snapshots of `query`. Dropping the
    /// returned registration detaches it.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let callback: SnapshotCallback = Arc::new(callback);
        let event_manager = self.inner.event_manager.clone();
        let id = self
            .inner
            .queue
            .enqueue(async move { event_manager.listen(query, options, callback).await })
            .await?;
        Ok(ListenerRegistration::new(self.clone(), id))
    }

    /// Applies `mutations` as one batch and resolves once the backend
    /// acknowledged or rejected it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = self.inner.sync_engine.clone();
        let completion = self
            .inner
            .queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("The write was abandoned before the backend answered."))?
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = self.inner.sync_engine.clone();
        let completion = self
            .inner
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback().await })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("Waiting for pending writes was abandoned."))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let local_store = self.inner.local_store.clone();
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                local_store.persistence().set_network_enabled(true);
                remote_store.enable_network().await
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let local_store = self.inner.local_store.clone();
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                local_store.persistence().set_network_enabled(false);
                remote_store.disable_network().await
            })
            .await
    }

    /// The cached state of `key` including pending writes. `None` when the
    /// cache knows the document does not exist.
    pub async fn get_document_from_local_cache(
        &self,
        key: DocumentKey,
    ) -> FirestoreResult<Option<MutableDocument>> {
        let local_store = self.inner.local_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                let document = local_store.read_document(&key).await?;
                if document.is_found_document() {
                    Ok(Some(document))
                } else if document.is_no_document() {
                    Ok(None)
                } else {
                    Err(unavailable(
                        "Failed to get document from cache. (However, this document may exist on the \
                         server. Run again without setting 'source' in the GetOptions to attempt to \
                         retrieve the document from the server.)",
                    ))
                }
            })
            .await
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = self.inner.local_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                let query_result = local_store.execute_query(&query, true).await?;
                let mut view = View::new(query, query_result.remote_keys);
                let changes = view.compute_doc_changes(&query_result.documents, None);
                let not_current =
                    TargetChange::create_synthesized_target_change_for_current_change(false, Vec::new());
                let view_change = view.apply_changes(changes, false, Some(&not_current), false);
                Ok(view_change
                    .snapshot
                    .unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    /// Stops the streams and timers and releases the primary lease. Later
    /// operations fail with `FailedPrecondition`.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        debug!("[{LOG_TAG}] Shutting down");
        self.inner.queue.enter_restricted_mode();
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue_even_while_restricted(async move {
                inner.lru_scheduler.stop();
                inner.backfill_scheduler.stop();
                let lease_refresh = lock_lease_refresh(&inner.lease_refresh).take();
                if let Some(task) = lease_refresh {
                    task.cancel();
                }
                inner.remote_store.shutdown().await?;
                inner.local_store.persistence().shutdown().await;
                Ok(())
            })
            .await
    }

    fn remove_listener(&self, id: u64) {
        let event_manager = self.inner.event_manager.clone();
        self.inner
            .queue
            .enqueue_and_forget(async move { event_manager.unlisten(id).await });
    }
}

/// Keeps the primary lease fresh while the client runs.
fn schedule_lease_refresh(
    queue: AsyncQueue,
    local_store: LocalStore,
    slot: Arc<Mutex<Option<DelayedOperation>>>,
) {
    let delay = Duration::from_millis(LEASE_REFRESH_INTERVAL_MS as u64);
    let next_queue = queue.clone();
    let next_slot = Arc::clone(&slot);
    let task = queue.enqueue_after_delay(TimerId::ClientMetadataRefresh, delay, move || async move {
        if let Err(err) = local_store.persistence().refresh_lease().await {
            warn!("[{LOG_TAG}] Failed to refresh the primary lease: {err}");
        }
        if !next_queue.is_shutting_down() {
            schedule_lease_refresh(next_queue, local_store, next_slot);
        }
        Ok(())
    });
    *lock_lease_refresh(&slot) = Some(task);
}

fn lock_lease_refresh(slot: &Mutex<Option<DelayedOperation>>) -> MutexGuard<'_, Option<DelayedOperation>> {
    slot.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// RAII-style listener registration; dropping the handle detaches the
/// listener.
pub struct ListenerRegistration {
    client: FirestoreClient,
    id: Option<u64>,
}

impl ListenerRegistration {
    fn new(client: FirestoreClient, id: u64) -> Self {
        Self {
            client,
            id: Some(id),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(id) = self.id.take() {
            self.client.remove_listener(id);
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.client.remove_listener(id);
        }
    }
}
