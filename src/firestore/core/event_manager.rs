use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

const LOG_TAG: &str = "EventManager";

/// Receives the snapshots of one listener, or its single terminal error.
pub type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes or
    /// `from_cache`).
    pub include_metadata_changes: bool,
    /// Hold back cached results while the client might still reach the
    /// backend.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_include_metadata_changes(mut self, value: bool) -> Self {
        self.include_metadata_changes = value;
        self
    }

    pub fn with_wait_for_sync_when_online(mut self, value: bool) -> Self {
        self.wait_for_sync_when_online = value;
        self
    }
}

/// Decides which view snapshots one listener gets to see.
///
/// The methods return the snapshot to hand to the listener, if any; the
/// caller delivers it once no lock is held.
pub struct QueryListener {
    options: ListenOptions,
    snapshot: Option<ViewSnapshot>,
    raised_initial_event: bool,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(options: ListenOptions) -> Self {
        Self {
            options,
            snapshot: None,
            raised_initial_event: false,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> Option<ViewSnapshot> {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                Some(self.raise_initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        raised
    }

    /// Going offline may release a held-back initial snapshot.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        let snapshot = self.snapshot.clone()?;
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            return Some(self.raise_initial_event(&snapshot));
        }
        None
    }

    pub fn has_raised_initial_event(&self) -> bool {
        self.raised_initial_event
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Empty cached results are not worth showing unless they are all
        // the client will get.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        let mut initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        if !self.options.include_metadata_changes {
            initial
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            initial.excludes_metadata_changes = true;
        }
        initial
    }
}

struct RegisteredListener {
    id: u64,
    listener: QueryListener,
    callback: SnapshotCallback,
}

struct QueryListenersInfo {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<RegisteredListener>,
}

struct EventManagerState {
    /// Keyed by the query's canonical id.
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    next_listener_id: u64,
}

type Delivery = (SnapshotCallback, FirestoreResult<ViewSnapshot>);

/// Fans the sync engine's per-query snapshots out to any number of
/// listeners, listening to each distinct query only once.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<EventManagerInner>,
}

struct EventManagerInner {
    sync_engine: SyncEngine,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    /// Registers itself as `sync_engine`'s listener.
    pub fn new(sync_engine: SyncEngine) -> Self {
        let online_state = sync_engine.online_state();
        let inner = Arc::new(EventManagerInner {
            sync_engine,
            state: Mutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state,
                next_listener_id: 0,
            }),
        });
        inner.sync_engine.set_listener(Arc::new(EventManagerSyncListener {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.inner.sync_engine
    }

    /// Adds a listener for `query` and returns its id. The first listener of
    /// a query starts listening in the sync engine; a failure there is also
    /// delivered to the callback.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> FirestoreResult<u64> {
        let canonical_id = query.canonical_id();
        let (id, first_listener, delivery) = {
            let mut state = self.lock();
            let id = state.next_listener_id;
            state.next_listener_id += 1;
            let online_state = state.online_state;
            let first_listener = !state.queries.contains_key(&canonical_id);
            let info = state
                .queries
                .entry(canonical_id.clone())
                .or_insert_with(|| QueryListenersInfo {
                    query: query.clone(),
                    view_snapshot: None,
                    listeners: Vec::new(),
                });

            let mut listener = QueryListener::new(options);
            listener.apply_online_state_change(online_state);
            let delivery = info
                .view_snapshot
                .clone()
                .and_then(|snapshot| listener.on_view_snapshot(snapshot));
            info.listeners.push(RegisteredListener {
                id,
                listener,
                callback: Arc::clone(&callback),
            });
            (id, first_listener, delivery)
        };
        if let Some(snapshot) = delivery {
            callback(Ok(snapshot));
        }

        if first_listener {
            if let Err(err) = self.inner.sync_engine.listen(query).await {
                debug!("[{LOG_TAG}] Listen for {canonical_id} failed: {err}");
                let removed = self.lock().queries.remove(&canonical_id);
                if let Some(info) = removed {
                    for registered in info.listeners {
                        (registered.callback)(Err(err.clone()));
                    }
                }
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Removes a listener. The last listener of a query stops the sync
    /// engine's listen. Unknown ids are ignored.
    pub async fn unlisten(&self, listener_id: u64) -> FirestoreResult<()> {
        let last_query = {
            let mut state = self.lock();
            let Some(canonical_id) = state
                .queries
                .iter()
                .find(|(_, info)| info.listeners.iter().any(|registered| registered.id == listener_id))
                .map(|(canonical_id, _)| canonical_id.clone())
            else {
                return Ok(());
            };
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.retain(|registered| registered.id != listener_id);
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id).map(|info| info.query)
            } else {
                None
            }
        };

        match last_query {
            Some(query) => self.inner.sync_engine.unlisten(&query).await,
            None => Ok(()),
        }
    }

    /// Listeners currently registered for `query`.
    pub fn listener_count(&self, query: &Query) -> usize {
        self.lock()
            .queries
            .get(&query.canonical_id())
            .map_or(0, |info| info.listeners.len())
    }

    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut deliveries: Vec<Delivery> = Vec::new();
        {
            let mut state = self.lock();
            for snapshot in snapshots {
                let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for registered in &mut info.listeners {
                    if let Some(raised) = registered.listener.on_view_snapshot(snapshot.clone()) {
                        deliveries.push((Arc::clone(&registered.callback), Ok(raised)));
                    }
                }
                info.view_snapshot = Some(snapshot);
            }
        }
        deliver(deliveries);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = self.lock().queries.remove(&query.canonical_id());
        let Some(info) = removed else {
            return;
        };
        deliver(
            info.listeners
                .into_iter()
                .map(|registered| (registered.callback, Err(error.clone())))
                .collect(),
        );
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut deliveries: Vec<Delivery> = Vec::new();
        {
            let mut state = self.lock();
            state.online_state = online_state;
            for info in state.queries.values_mut() {
                for registered in &mut info.listeners {
                    if let Some(raised) = registered.listener.apply_online_state_change(online_state) {
                        deliveries.push((Arc::clone(&registered.callback), Ok(raised)));
                    }
                }
            }
        }
        deliver(deliveries);
    }

    fn lock(&self) -> MutexGuard<'_, EventManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (callback, outcome) in deliveries {
        callback(outcome);
    }
}

struct EventManagerSyncListener {
    inner: Weak<EventManagerInner>,
}

impl EventManagerSyncListener {
    fn manager(&self) -> Option<EventManager> {
        self.inner.upgrade().map(|inner| EventManager { inner })
    }
}

impl SyncEngineListener for EventManagerSyncListener {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        if let Some(manager) = self.manager() {
            manager.on_watch_change(snapshots);
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        if let Some(manager) = self.manager() {
            manager.on_watch_error(query, error);
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        if let Some(manager) = self.manager() {
            manager.on_online_state_change(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::core::sync_engine::SyncEngineSettings;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::local_store::{LocalStore, LocalStoreConfig};
    use crate::firestore::local::persistence::MemoryPersistence;
    use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
    use crate::firestore::remote::datastore::{InMemoryBackend, NoopTokenProvider};
    use crate::firestore::remote::network::NetworkLayer;
    use crate::firestore::remote::serializer::JsonProtoSerializer;
    use crate::firestore::value::MapValue;
    use crate::util::async_queue::AsyncQueue;

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn snapshot(paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let query = rooms();
        let mut docs = DocumentSet::new(&query);
        for path in paths {
            docs.insert(MutableDocument::new_found_document(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::new(Timestamp::new(1, 0)),
                MapValue::empty(),
            ));
        }
        ViewSnapshot::from_initial_documents(query, docs, Default::default(), from_cache, false)
    }

    fn metadata_only(previous: &ViewSnapshot, from_cache: bool) -> ViewSnapshot {
        let mut snapshot = previous.clone();
        snapshot.old_docs = previous.docs.clone();
        snapshot.doc_changes.clear();
        snapshot.from_cache = from_cache;
        snapshot.sync_state_changed = true;
        snapshot
    }

    #[test]
    fn waits_for_sync_while_possibly_online() {
        let options = ListenOptions::default().with_wait_for_sync_when_online(true);
        let mut listener = QueryListener::new(options);
        assert!(listener.on_view_snapshot(snapshot(&["rooms/a"], true)).is_none());

        let raised = listener.apply_online_state_change(OnlineState::Offline).unwrap();
        assert!(raised.from_cache);
        assert_eq!(raised.doc_changes.len(), 1);
        assert!(listener.has_raised_initial_event());
    }

    #[test]
    fn empty_cached_results_are_held_back_until_offline() {
        let mut listener = QueryListener::new(ListenOptions::default());
        assert!(listener.on_view_snapshot(snapshot(&[], true)).is_none());
        assert!(listener.on_view_snapshot(snapshot(&[], false)).is_some());
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let first = snapshot(&["rooms/a"], true);
        let second = metadata_only(&first, false);

        let mut plain = QueryListener::new(ListenOptions::default());
        assert!(plain.on_view_snapshot(first.clone()).is_some());
        assert!(plain.on_view_snapshot(second.clone()).is_none());

        let mut with_metadata =
            QueryListener::new(ListenOptions::default().with_include_metadata_changes(true));
        assert!(with_metadata.on_view_snapshot(first).is_some());
        let raised = with_metadata.on_view_snapshot(second).unwrap();
        assert!(!raised.from_cache);
        assert!(!raised.excludes_metadata_changes);
    }

    type Received = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn recording_callback() -> (SnapshotCallback, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback: SnapshotCallback = Arc::new(move |outcome| sink.lock().unwrap().push(outcome));
        (callback, received)
    }

    async fn event_manager() -> EventManager {
        let database_id = DatabaseId::new("p", "(default)");
        let (_backend, datastore) = InMemoryBackend::pair(database_id.clone());
        let layer = NetworkLayer::builder(Arc::new(datastore), Arc::new(NoopTokenProvider))
            .build(AsyncQueue::new());
        let persistence = MemoryPersistence::new("client");
        persistence.start().await.unwrap();
        let local_store = LocalStore::new(persistence, "user", LocalStoreConfig::default());
        let sync_engine = SyncEngine::new(
            local_store,
            &layer,
            JsonProtoSerializer::new(database_id),
            "user",
            SyncEngineSettings::default(),
        );
        sync_engine.remote_store().disable_network().await.unwrap();
        EventManager::new(sync_engine)
    }

    #[tokio::test]
    async fn listeners_share_a_query_until_the_last_leaves() {
        let manager = event_manager().await;
        let (first_callback, _first) = recording_callback();
        let (second_callback, _second) = recording_callback();

        let first = manager
            .listen(rooms(), ListenOptions::default(), first_callback)
            .await
            .unwrap();
        let second = manager
            .listen(rooms(), ListenOptions::default(), second_callback)
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.listener_count(&rooms()), 2);

        manager.unlisten(first).await.unwrap();
        assert_eq!(manager.listener_count(&rooms()), 1);
        manager.unlisten(second).await.unwrap();
        assert_eq!(manager.listener_count(&rooms()), 0);
        manager.unlisten(second).await.unwrap();
    }

    #[tokio::test]
    async fn offline_client_raises_empty_cached_results() {
        let manager = event_manager().await;
        let (callback, received) = recording_callback();
        manager
            .listen(rooms(), ListenOptions::default(), callback)
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let snapshot = received[0].as_ref().unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.docs.is_empty());
    }

    #[tokio::test]
    async fn watch_error_is_delivered_once_and_drops_the_query() {
        let manager = event_manager().await;
        let (callback, received) = recording_callback();
        manager
            .listen(rooms(), ListenOptions::default(), callback)
            .await
            .unwrap();
        let target_id = manager.sync_engine().listen(rooms()).await.unwrap();

        manager
            .sync_engine()
            .reject_listen(target_id, permission_denied("no access"))
            .await
            .unwrap();
        let errors: Vec<FirestoreErrorCode> = received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|outcome| outcome.as_ref().err().map(|err| err.code))
            .collect();
        assert_eq!(errors, vec![FirestoreErrorCode::PermissionDenied]);
        assert_eq!(manager.listener_count(&rooms()), 0);
    }
}
