use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::channel::oneshot;
use log::{debug, warn};

use crate::firestore::core::query::{Query, Target};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{OnlineState, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::firestore::core::view::{LimboDocumentChange, View, ViewDocumentChanges, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::local_store::{LocalStore, QueryResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::firestore::remote::serializer::JsonProtoSerializer;

const LOG_TAG: &str = "SyncEngine";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEngineSettings {
    /// Limbo documents resolved at the same time; the rest wait in a queue.
    pub max_concurrent_limbo_resolutions: usize,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: 100,
        }
    }
}

impl SyncEngineSettings {
    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }
}

/// Where a document stands in limbo resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboState {
    NotTracked,
    /// Waiting for a free resolution slot.
    Enqueued,
    /// A document target for the key is being listened to.
    ActivelyListening,
    /// The backend answered for the key; the target goes away once no view
    /// holds the document in limbo anymore.
    Resolved,
}

/// Receives what the sync engine produces for the query listeners.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query failed for good and will receive no more snapshots.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves once the batch is acknowledged, or fails with the rejection.
pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// The limbo target delivered the document; its key is reported as the
    /// target's remote key from now on.
    received_document: bool,
}

/// Watch changes the sync engine asks the remote store for, run after its
/// state lock is released.
enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct PendingViewUpdate {
    canonical_id: String,
    query: Query,
    target_id: TargetId,
    changes: ViewDocumentChanges,
}

struct SyncEngineState {
    /// Keyed by the query's canonical id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Which targets hold each limbo document.
    limbo_document_refs: ReferenceSet,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
    current_user: String,
}

impl SyncEngineState {
    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
        actions: &mut Vec<RemoteAction>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, actions);
                }
                LimboDocumentChange::Removed(key) => {
                    debug!("[{LOG_TAG}] Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, actions: &mut Vec<RemoteAction>) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        debug!("[{LOG_TAG}] New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Starts resolutions for queued limbo documents while slots are free.
    fn pump_enqueued_limbo_resolutions(&mut self, actions: &mut Vec<RemoteAction>) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_id_generator.next_id();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            actions.push(RemoteAction::Listen(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut Vec<RemoteAction>) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.active_limbo_resolutions_by_target.remove(&target_id);
        actions.push(RemoteAction::Unlisten(target_id));
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Forgets every query of `target_id` and the limbo documents only it
    /// referenced. Returns the forgotten queries.
    fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        actions: &mut Vec<RemoteAction>,
    ) -> Vec<Query> {
        let queries = self.queries_by_target.remove(&target_id).unwrap_or_default();
        for query in &queries {
            self.query_views.remove(&query.canonical_id());
        }
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, actions);
            }
        }
        queries
    }

    fn take_mutation_callback(&mut self, batch_id: BatchId) -> Option<oneshot::Sender<FirestoreResult<()>>> {
        self.mutation_user_callbacks
            .get_mut(&self.current_user)
            .and_then(|callbacks| callbacks.remove(&batch_id))
    }
}

/// Glue between the local store, the remote store and the query views.
///
/// Every method is expected to run on the client's async queue. The engine
/// never holds its own lock across an await, so the remote store can query
/// [`RemoteSyncer::get_remote_keys_for_target`] at any time.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

struct SyncEngineInner {
    local_store: LocalStore,
    remote_store: RemoteStore,
    listener: Mutex<Option<Arc<dyn SyncEngineListener>>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    /// Builds the engine together with the remote store it drives.
    pub fn new(
        local_store: LocalStore,
        network_layer: &NetworkLayer,
        serializer: JsonProtoSerializer,
        user_id: impl Into<String>,
        settings: SyncEngineSettings,
    ) -> Self {
        let current_user = user_id.into();
        let inner = Arc::new_cyclic(|weak: &Weak<SyncEngineInner>| {
            let syncer: Arc<dyn RemoteSyncer> = Arc::new(SyncEngineRemoteSyncer {
                inner: weak.clone(),
            });
            let remote_store = RemoteStore::new(local_store.clone(), network_layer, serializer, syncer);
            SyncEngineInner {
                local_store,
                remote_store,
                listener: Mutex::new(None),
                state: Mutex::new(SyncEngineState {
                    query_views: BTreeMap::new(),
                    queries_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                    max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                    mutation_user_callbacks: BTreeMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                    online_state: OnlineState::Unknown,
                    current_user,
                }),
            }
        });
        Self { inner }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.inner.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.inner.remote_store
    }

    pub fn set_listener(&self, listener: Arc<dyn SyncEngineListener>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(listener);
    }

    pub fn online_state(&self) -> OnlineState {
        self.lock().online_state
    }

    pub fn current_user(&self) -> String {
        self.lock().current_user.clone()
    }

    /// Starts listening to `query` and emits its first snapshot. Identical
    /// queries share one target.
    pub async fn listen(&self, query: Query) -> FirestoreResult<TargetId> {
        let canonical_id = query.canonical_id();
        let existing = {
            let state = self.lock();
            state
                .query_views
                .get(&canonical_id)
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        };
        if let Some((target_id, snapshot)) = existing {
            self.notify_watch_change(vec![snapshot]);
            return Ok(target_id);
        }

        let target_data = self
            .inner
            .local_store
            .allocate_target(query.to_target())
            .await?;
        let target_id = target_data.target_id;
        let query_result = self.inner.local_store.execute_query(&query, true).await?;

        let mut actions = Vec::new();
        let snapshot = {
            let mut state = self.lock();
            initialize_view(
                &mut state,
                query,
                target_id,
                query_result,
                target_data.resume_token.clone(),
                &mut actions,
            )
        };
        self.notify_watch_change(vec![snapshot]);

        self.inner.remote_store.listen(target_data).await?;
        self.run_remote_actions(actions).await?;
        Ok(target_id)
    }

    /// Stops listening to `query`. The last query of a target releases it
    /// locally and unwatches it remotely.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.lock();
            let Some(target_id) = state
                .query_views
                .get(&canonical_id)
                .map(|query_view| query_view.target_id)
            else {
                debug!("[{LOG_TAG}] Ignoring unlisten of inactive query {canonical_id}");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        self.release_target(target_id).await?;
        self.inner.remote_store.unlisten(target_id).await?;
        let mut actions = Vec::new();
        self.lock().remove_and_cleanup_target(target_id, &mut actions);
        self.run_remote_actions(actions).await
    }

    /// Applies `mutations` locally and queues them for the backend.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let result = self.inner.local_store.local_write(mutations).await?;
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.lock();
            let user = state.current_user.clone();
            state
                .mutation_user_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, sender);
        }
        self.emit_new_snaps_and_notify_local_store(result.changes, None)
            .await?;
        self.inner.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> FirestoreResult<WriteCompletion> {
        if !self.inner.remote_store.is_network_enabled().await {
            debug!(
                "[{LOG_TAG}] The network is disabled. Waiting for pending writes will not \
                 complete until the network is enabled."
            );
        }
        let highest_batch_id = self
            .inner
            .local_store
            .get_highest_unacknowledged_batch_id()
            .await?;
        let (sender, receiver) = oneshot::channel();
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.lock()
                .pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    pub async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.inner.local_store.apply_remote_event(&event).await?;
        {
            let mut state = self.lock();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let change_count = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                if change_count > 1 {
                    return Err(internal_error(
                        "Limbo resolution for a single document contains multiple changes",
                    ));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(
                            "Received change for limbo target document without add",
                        ));
                    }
                } else if !change.removed_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error(
                            "Received remove for limbo target document without add",
                        ));
                    }
                    resolution.received_document = false;
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(changes, Some(&event))
            .await
    }

    /// The backend refused a target. A limbo target resolves its document as
    /// deleted; a query target fails its listeners and is released.
    pub async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .lock()
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        if let Some(key) = limbo_key {
            debug!("[{LOG_TAG}] Limbo resolution for {key} rejected: {error}");
            // Treat the document as deleted so views stop showing it.
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event(event).await?;

            let mut actions = Vec::new();
            {
                let mut state = self.lock();
                state.active_limbo_targets_by_key.remove(&key);
                state.active_limbo_resolutions_by_target.remove(&target_id);
                state.pump_enqueued_limbo_resolutions(&mut actions);
            }
            return self.run_remote_actions(actions).await;
        }

        self.release_target(target_id).await?;
        let mut actions = Vec::new();
        let queries = self.lock().remove_and_cleanup_target(target_id, &mut actions);
        if let Some(listener) = self.listener() {
            for query in &queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        self.run_remote_actions(actions).await
    }

    pub async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.inner.local_store.acknowledge_batch(&result).await?;
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None)
            .await
    }

    pub async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.inner.local_store.reject_batch(batch_id).await?;
        self.process_user_callback(batch_id, Some(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None)
            .await
    }

    pub fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.lock();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect()
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
        }
        self.notify_watch_change(snapshots);
    }

    /// Switches to `user_id`'s mutation queue and recomputes the views.
    pub async fn handle_credential_change(&self, user_id: String) -> FirestoreResult<()> {
        if self.lock().current_user == user_id {
            return Ok(());
        }
        debug!("[{LOG_TAG}] User change. New user: {user_id:?}");
        let result = self.inner.local_store.handle_user_change(&user_id).await?;
        let pending = {
            let mut state = self.lock();
            state.current_user = user_id;
            std::mem::take(&mut state.pending_writes_callbacks)
        };
        for sender in pending.into_values().flatten() {
            let _ = sender.send(Err(cancelled(
                "Waiting for pending writes was cancelled by a user change.",
            )));
        }
        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None)
            .await
    }

    /// Keys the backend is believed to hold for `target_id`.
    pub fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.lock();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = BTreeSet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    pub fn limbo_state(&self, key: &DocumentKey) -> LimboState {
        let state = self.lock();
        if let Some(target_id) = state.active_limbo_targets_by_key.get(key) {
            return match state.active_limbo_resolutions_by_target.get(target_id) {
                Some(resolution) if resolution.received_document => LimboState::Resolved,
                _ => LimboState::ActivelyListening,
            };
        }
        if state.enqueued_limbo_resolutions.contains(key) {
            LimboState::Enqueued
        } else {
            LimboState::NotTracked
        }
    }

    /// Limbo documents with an active resolution target.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock().active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.lock().enqueued_limbo_resolutions.iter().cloned().collect()
    }

    async fn release_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        match self.inner.local_store.release_target(target_id, false).await {
            Ok(()) => Ok(()),
            Err(err) if err.code == FirestoreErrorCode::FailedPrecondition => {
                debug!("[{LOG_TAG}] Ignoring failed release of target {target_id}: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Feeds `changes` through every view, emits the resulting snapshots and
    /// tells the local store which documents the views now show.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: BTreeMap<DocumentKey, MutableDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let pending: Vec<PendingViewUpdate> = {
            let state = self.lock();
            state
                .query_views
                .iter()
                .map(|(canonical_id, query_view)| PendingViewUpdate {
                    canonical_id: canonical_id.clone(),
                    query: query_view.query.clone(),
                    target_id: query_view.target_id,
                    changes: query_view.view.compute_doc_changes(&changes, None),
                })
                .collect()
        };

        let mut updates = Vec::with_capacity(pending.len());
        for mut update in pending {
            if update.changes.needs_refill {
                // A limit query lost documents at its edge; rerun it locally
                // to find the ones that move into the window.
                let QueryResult { documents, .. } = self
                    .inner
                    .local_store
                    .execute_query(&update.query, false)
                    .await?;
                let state = self.lock();
                if let Some(query_view) = state.query_views.get(&update.canonical_id) {
                    update.changes = query_view
                        .view
                        .compute_doc_changes(&documents, Some(update.changes));
                }
            }
            updates.push(update);
        }

        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut actions = Vec::new();
        {
            let mut state = self.lock();
            for update in updates {
                let target_change = remote_event.and_then(|event| event.target_changes.get(&update.target_id));
                let target_is_pending_reset = remote_event
                    .is_some_and(|event| event.target_mismatches.contains_key(&update.target_id));
                let view_change = match state.query_views.get_mut(&update.canonical_id) {
                    Some(query_view) => query_view.view.apply_changes(
                        update.changes,
                        true,
                        target_change,
                        target_is_pending_reset,
                    ),
                    None => continue,
                };
                state.update_tracked_limbos(update.target_id, view_change.limbo_changes, &mut actions);
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(snapshot.local_view_changes(update.target_id));
                    snapshots.push(snapshot);
                }
            }
        }

        self.notify_watch_change(snapshots);
        self.inner
            .local_store
            .notify_local_view_changes(&view_changes)
            .await?;
        self.run_remote_actions(actions).await
    }

    async fn run_remote_actions(&self, actions: Vec<RemoteAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                RemoteAction::Listen(target_data) => {
                    self.inner.remote_store.listen(target_data).await?
                }
                RemoteAction::Unlisten(target_id) => {
                    self.inner.remote_store.unlisten(target_id).await?
                }
            }
        }
        Ok(())
    }

    fn process_user_callback(&self, batch_id: BatchId, error: Option<FirestoreError>) {
        let Some(sender) = self.lock().take_mutation_callback(batch_id) else {
            return;
        };
        let outcome = match error {
            Some(error) => Err(error),
            None => Ok(()),
        };
        let _ = sender.send(outcome);
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self.lock().pending_writes_callbacks.remove(&batch_id);
        for sender in callbacks.into_iter().flatten() {
            let _ = sender.send(Ok(()));
        }
    }

    fn notify_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        match self.listener() {
            Some(listener) => listener.on_watch_change(snapshots),
            None => warn!("[{LOG_TAG}] Dropping {} snapshots without a listener", snapshots.len()),
        }
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, SyncEngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Builds the view of a newly listened query from the cached results.
fn initialize_view(
    state: &mut SyncEngineState,
    query: Query,
    target_id: TargetId,
    query_result: QueryResult,
    resume_token: Vec<u8>,
    actions: &mut Vec<RemoteAction>,
) -> ViewSnapshot {
    let mut view = View::new(query.clone(), query_result.remote_keys);
    let doc_changes = view.compute_doc_changes(&query_result.documents, None);
    // The target is never current before the backend says so.
    let synthesized = TargetChange::create_synthesized_target_change_for_current_change(false, resume_token);
    let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
    state.update_tracked_limbos(target_id, view_change.limbo_changes, actions);

    let snapshot = view_change
        .snapshot
        .unwrap_or_else(|| view.compute_initial_snapshot());
    state
        .queries_by_target
        .entry(target_id)
        .or_default()
        .push(query.clone());
    state.query_views.insert(
        query.canonical_id(),
        QueryView {
            query,
            target_id,
            view,
        },
    );
    snapshot
}

/// The remote store's handle on the engine. Weak, since the engine owns the
/// remote store.
struct SyncEngineRemoteSyncer {
    inner: Weak<SyncEngineInner>,
}

impl SyncEngineRemoteSyncer {
    fn engine(&self) -> Option<SyncEngine> {
        self.inner.upgrade().map(|inner| SyncEngine { inner })
    }
}

impl RemoteSyncer for SyncEngineRemoteSyncer {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match self.engine() {
                Some(engine) => engine.apply_remote_event(event).await,
                None => Ok(()),
            }
        })
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match self.engine() {
                Some(engine) => engine.reject_listen(target_id, error).await,
                None => Ok(()),
            }
        })
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match self.engine() {
                Some(engine) => engine.apply_successful_write(result).await,
                None => Ok(()),
            }
        })
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match self.engine() {
                Some(engine) => engine.reject_failed_write(batch_id, error).await,
                None => Ok(()),
            }
        })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.engine()
            .map(|engine| engine.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(async move {
            if let Some(engine) = self.engine() {
                engine.apply_online_state_change(online_state);
            }
        })
    }

    fn handle_credential_change(&self, user_id: String) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            match self.engine() {
                Some(engine) => engine.handle_credential_change(user_id).await,
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::permission_denied;
    use crate::firestore::local::local_store::LocalStoreConfig;
    use crate::firestore::local::persistence::MemoryPersistence;
    use crate::firestore::model::{DatabaseId, FieldPath, Timestamp};
    use crate::firestore::remote::datastore::{InMemoryBackend, NoopTokenProvider};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use crate::util::async_queue::AsyncQueue;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreErrorCode)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors
                .lock()
                .unwrap()
                .push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    impl RecordingListener {
        fn last_keys(&self) -> Vec<String> {
            let snapshots = self.snapshots.lock().unwrap();
            snapshots
                .last()
                .map(|snapshot| snapshot.docs.keys().map(ToString::to_string).collect())
                .unwrap_or_default()
        }
    }

    async fn engine(settings: SyncEngineSettings) -> (SyncEngine, Arc<RecordingListener>) {
        let database_id = DatabaseId::new("p", "(default)");
        let (_backend, datastore) = InMemoryBackend::pair(database_id.clone());
        let layer = NetworkLayer::builder(Arc::new(datastore), Arc::new(NoopTokenProvider))
            .build(AsyncQueue::new());
        let persistence = MemoryPersistence::new("client");
        persistence.start().await.unwrap();
        let local_store = LocalStore::new(persistence, "user", LocalStoreConfig::default());
        let engine = SyncEngine::new(
            local_store,
            &layer,
            JsonProtoSerializer::new(database_id),
            "user",
            settings,
        );
        // Keep the streams closed; remote events are injected directly.
        engine.remote_store().disable_network().await.unwrap();
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(Arc::clone(&listener) as Arc<dyn SyncEngineListener>);
        (engine, listener)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("value").unwrap(),
            FirestoreValue::from_integer(value),
        );
        data
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(seconds), data(seconds))
    }

    fn target_event(
        seconds: i64,
        target_id: TargetId,
        added: &[&str],
        removed: &[&str],
        documents: Vec<MutableDocument>,
    ) -> RemoteEvent {
        let mut event = RemoteEvent {
            snapshot_version: version(seconds),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            target_id,
            TargetChange {
                resume_token: format!("token-{seconds}").into_bytes(),
                current: true,
                added_documents: added.iter().map(|path| key(path)).collect(),
                removed_documents: removed.iter().map(|path| key(path)).collect(),
                ..TargetChange::default()
            },
        );
        for document in documents {
            event.document_updates.insert(document.key().clone(), document);
        }
        event
    }

    #[tokio::test]
    async fn documents_dropped_by_the_backend_are_resolved_through_limbo() {
        let (engine, listener) = engine(SyncEngineSettings::default()).await;
        let query = Query::collection("rooms").unwrap();
        let target_id = engine.listen(query.clone()).await.unwrap();

        engine
            .apply_remote_event(target_event(
                1,
                target_id,
                &["rooms/a", "rooms/b"],
                &[],
                vec![found("rooms/a", 1), found("rooms/b", 1)],
            ))
            .await
            .unwrap();
        assert_eq!(listener.last_keys(), vec!["rooms/a", "rooms/b"]);
        assert!(!listener.snapshots.lock().unwrap().last().unwrap().from_cache);

        // The backend stops listing b without telling us why.
        engine
            .apply_remote_event(target_event(2, target_id, &[], &["rooms/b"], vec![]))
            .await
            .unwrap();
        assert_eq!(engine.limbo_state(&key("rooms/b")), LimboState::ActivelyListening);
        let limbo_target = engine.active_limbo_document_resolutions()[&key("rooms/b")];
        assert_eq!(limbo_target % 2, 1);
        assert!(listener.snapshots.lock().unwrap().last().unwrap().from_cache);

        // The document target comes back current and empty: b is gone.
        let mut resolution = target_event(
            3,
            limbo_target,
            &[],
            &[],
            vec![MutableDocument::new_no_document(key("rooms/b"), version(3))],
        );
        resolution.resolved_limbo_documents.insert(key("rooms/b"));
        engine.apply_remote_event(resolution).await.unwrap();

        assert_eq!(engine.limbo_state(&key("rooms/b")), LimboState::NotTracked);
        assert_eq!(listener.last_keys(), vec!["rooms/a"]);
        assert!(!listener.snapshots.lock().unwrap().last().unwrap().from_cache);
    }

    #[tokio::test]
    async fn limbo_resolutions_beyond_the_limit_wait_in_queue() {
        let settings = SyncEngineSettings::default().with_max_concurrent_limbo_resolutions(1);
        let (engine, _listener) = engine(settings).await;
        let target_id = engine.listen(Query::collection("rooms").unwrap()).await.unwrap();
        engine
            .apply_remote_event(target_event(
                1,
                target_id,
                &["rooms/a", "rooms/b"],
                &[],
                vec![found("rooms/a", 1), found("rooms/b", 1)],
            ))
            .await
            .unwrap();
        engine
            .apply_remote_event(target_event(2, target_id, &[], &["rooms/a", "rooms/b"], vec![]))
            .await
            .unwrap();

        assert_eq!(engine.active_limbo_document_resolutions().len(), 1);
        assert_eq!(engine.enqueued_limbo_document_resolutions(), vec![key("rooms/b")]);
        assert_eq!(engine.limbo_state(&key("rooms/b")), LimboState::Enqueued);

        // A rejected limbo listen counts as a delete and frees the slot.
        let limbo_target = engine.active_limbo_document_resolutions()[&key("rooms/a")];
        engine
            .reject_listen(limbo_target, permission_denied("no access"))
            .await
            .unwrap();
        assert_eq!(engine.limbo_state(&key("rooms/a")), LimboState::NotTracked);
        assert_eq!(engine.limbo_state(&key("rooms/b")), LimboState::ActivelyListening);
    }

    #[tokio::test]
    async fn rejected_listen_fails_the_query_once() {
        let (engine, listener) = engine(SyncEngineSettings::default()).await;
        let query = Query::collection("rooms").unwrap();
        let target_id = engine.listen(query.clone()).await.unwrap();

        engine
            .reject_listen(target_id, permission_denied("no access"))
            .await
            .unwrap();
        engine
            .reject_listen(target_id, permission_denied("no access"))
            .await
            .unwrap();
        assert_eq!(
            listener.errors.lock().unwrap().clone(),
            vec![(query.canonical_id(), FirestoreErrorCode::PermissionDenied)]
        );
        assert!(engine.get_remote_keys_for_target(target_id).is_empty());

        // The query can be listened to again afterwards.
        engine.listen(query).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_write_reverts_view_and_fails_the_caller() {
        let (engine, listener) = engine(SyncEngineSettings::default()).await;
        engine.listen(Query::collection("rooms").unwrap()).await.unwrap();

        let mutation = Mutation::set(key("rooms/a"), data(1)).unwrap();
        let completion = engine.write(vec![mutation]).await.unwrap();
        {
            let snapshots = listener.snapshots.lock().unwrap();
            let latest = snapshots.last().unwrap();
            assert!(latest.has_pending_writes());
            assert_eq!(latest.docs.len(), 1);
        }
        let pending = engine.register_pending_writes_callback().await.unwrap();

        let batch_id = engine
            .local_store()
            .get_highest_unacknowledged_batch_id()
            .await
            .unwrap();
        engine
            .reject_failed_write(batch_id, permission_denied("denied"))
            .await
            .unwrap();

        let outcome = completion.await.unwrap();
        assert_eq!(outcome.unwrap_err().code, FirestoreErrorCode::PermissionDenied);
        assert!(pending.await.unwrap().is_ok());
        assert!(listener.last_keys().is_empty());
    }

    #[tokio::test]
    async fn identical_queries_share_one_target() {
        let (engine, listener) = engine(SyncEngineSettings::default()).await;
        let query = Query::collection("rooms").unwrap();
        let first = engine.listen(query.clone()).await.unwrap();
        let second = engine.listen(query.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(listener.snapshots.lock().unwrap().len(), 2);

        engine.unlisten(&query).await.unwrap();
        assert!(engine.local_store().get_target_data(first).await.is_none());
    }

    #[tokio::test]
    async fn going_offline_reports_cached_results() {
        let (engine, listener) = engine(SyncEngineSettings::default()).await;
        let target_id = engine.listen(Query::collection("rooms").unwrap()).await.unwrap();
        engine
            .apply_remote_event(target_event(1, target_id, &["rooms/a"], &[], vec![found("rooms/a", 1)]))
            .await
            .unwrap();
        listener.snapshots.lock().unwrap().clear();

        engine.apply_online_state_change(OnlineState::Offline);
        assert_eq!(engine.online_state(), OnlineState::Offline);
        assert!(listener.online_states.lock().unwrap().contains(&OnlineState::Offline));
        let snapshots = listener.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache);
    }
}
