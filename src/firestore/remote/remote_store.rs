use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use log::{debug, warn};

use crate::firestore::core::types::{OnlineState, TargetId};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteSyncer};
use crate::firestore::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    ListenStream, WatchStreamListener, WriteStream, WriteStreamListener,
};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};

const LOG_TAG: &str = "RemoteStore";

/// Batches sent on the write stream without an acknowledgement yet.
const MAX_PENDING_WRITES: usize = 10;

/// Why the remote store is not using the network. The network is used only
/// while no cause is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    /// Another client holds the primary lease.
    NotPrimary,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets to (re)send whenever the watch stream opens, keyed by id.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    /// Batches handed to the write stream, oldest first. Acknowledgements
    /// arrive in the same order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Keeps the watch and write streams in step with the local store.
///
/// Listens are re-sent whenever the watch stream reconnects, resuming each
/// target from its last resume token. Pending mutation batches are streamed
/// to the backend in batch order and acknowledged through the
/// [`RemoteSyncer`]. All methods are meant to run on the client's async
/// queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    local_store: LocalStore,
    serializer: JsonProtoSerializer,
    syncer: Arc<dyn RemoteSyncer>,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    /// Builds a remote store that starts with the network enabled but no
    /// stream running; streams open lazily once there is work for them.
    pub fn new(
        local_store: LocalStore,
        network_layer: &NetworkLayer,
        serializer: JsonProtoSerializer,
        syncer: Arc<dyn RemoteSyncer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = ListenStream::new(
                network_layer,
                serializer.clone(),
                Arc::new(WatchListenerAdapter {
                    inner: weak.clone(),
                }),
            );
            let write_stream = WriteStream::new(
                network_layer,
                serializer.clone(),
                Arc::new(WriteListenerAdapter {
                    inner: weak.clone(),
                }),
            );
            let state_syncer = Arc::clone(&syncer);
            let handler: OnlineStateHandler = Arc::new(move |online_state| {
                let syncer = Arc::clone(&state_syncer);
                box_remote_store_future(async move {
                    syncer.apply_online_state_change(online_state).await
                })
            });
            let online_state_tracker = OnlineStateTracker::new(
                network_layer.queue().clone(),
                handler,
                network_layer.retry_settings().online_state_timeout,
            );
            RemoteStoreInner {
                local_store,
                serializer,
                syncer,
                watch_stream,
                write_stream,
                online_state_tracker,
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_change_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Loads the persisted stream token and starts the streams that have
    /// work.
    pub async fn start(&self) -> FirestoreResult<()> {
        let token = self.inner.local_store.get_last_stream_token().await?;
        self.inner.write_stream.set_last_stream_token(token);
        self.inner.enable_network_internal().await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network).
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and reports the client offline until
    /// [`enable_network`](Self::enable_network).
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await?;
        self.inner
            .online_state_tracker
            .set(OnlineState::Offline)
            .await;
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        debug!("[{LOG_TAG}] Shutting down");
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await?;
        self.inner
            .online_state_tracker
            .set(OnlineState::Unknown)
            .await;
        Ok(())
    }

    /// Starts watching `target_data`. A target already listened to is left
    /// untouched.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let inner = &self.inner;
        let target_id = target_data.target_id;
        let should_start = {
            let mut state = inner.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());
            inner.should_start_watch_stream(&state)
        };

        if should_start {
            inner.start_watch_stream().await
        } else if inner.watch_stream.is_open() {
            inner.send_watch_request(target_data).await
        } else {
            Ok(())
        }
    }

    /// Stops watching `target_id`. The stream goes idle once nothing is
    /// listened to anymore.
    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let inner = &self.inner;
        let no_targets_left = {
            let mut state = inner.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                debug!("[{LOG_TAG}] Ignoring unlisten of unknown target {target_id}");
                return Ok(());
            }
            state.listen_targets.is_empty()
        };

        if inner.watch_stream.is_open() {
            inner.send_unwatch_request(target_id).await?;
        }
        if no_targets_left {
            if inner.watch_stream.is_open() {
                inner.watch_stream.mark_idle();
            } else if inner.state.lock().await.can_use_network() {
                // No stream means nothing can report the state; revert to
                // `Unknown` so cached results are not shown as online.
                inner.online_state_tracker.set(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    /// Pulls pending batches from the local store into the write pipeline
    /// and sends them if the write stream is ready.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams under the new user's credentials after the
    /// sync engine switched users.
    pub async fn handle_credential_change(&self, user_id: String) -> FirestoreResult<()> {
        let inner = &self.inner;
        inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        inner.disable_network_internal().await?;
        inner.online_state_tracker.set(OnlineState::Unknown).await;
        let result = inner.syncer.handle_credential_change(user_id).await;
        inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        result?;
        let token = inner.local_store.get_last_stream_token().await?;
        inner.write_stream.set_last_stream_token(token);
        inner.enable_network_internal().await
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let inner = &self.inner;
        if is_primary {
            inner
                .state
                .lock()
                .await
                .offline_causes
                .remove(&OfflineCause::NotPrimary);
            inner.enable_network_internal().await
        } else {
            inner
                .state
                .lock()
                .await
                .offline_causes
                .insert(OfflineCause::NotPrimary);
            inner.disable_network_internal().await?;
            inner.online_state_tracker.set(OnlineState::Unknown).await;
            Ok(())
        }
    }

    pub async fn is_network_enabled(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    /// Batches sent but not yet acknowledged.
    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

impl RemoteStoreInner {
    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.watch_stream.is_started()
            && !state.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network()
            && !self.write_stream.is_started()
            && !state.write_pipeline.is_empty()
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        let (can_use_network, should_start_watch) = {
            let state = self.state.lock().await;
            (state.can_use_network(), self.should_start_watch_stream(&state))
        };
        if !can_use_network {
            return Ok(());
        }
        if should_start_watch {
            self.start_watch_stream().await?;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) -> FirestoreResult<()> {
        self.write_stream.stop().await?;
        self.watch_stream.stop().await?;

        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            debug!(
                "[{LOG_TAG}] Stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_change_aggregator = None;
        Ok(())
    }

    async fn start_watch_stream(&self) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if !self.should_start_watch_stream(&state) {
                return Ok(());
            }
            state.watch_change_aggregator = Some(WatchChangeAggregator::new(self.serializer.clone()));
        }
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start().await;
        Ok(())
    }

    /// Sends `target_data` on the open watch stream. Targets resumed from a
    /// token carry the number of documents the client expects, so the
    /// backend can report deletes missed while away.
    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let request = {
            let mut state = self.state.lock().await;
            if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_data.target_id);
            }
            if !target_data.resume_token.is_empty()
                || target_data.snapshot_version > SnapshotVersion::min()
            {
                let expected_count = self
                    .syncer
                    .get_remote_keys_for_target(target_data.target_id)
                    .len();
                target_data.with_expected_count(expected_count as i32)
            } else {
                target_data
            }
        };
        self.watch_stream.watch(&request).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state.lock().await.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id).await
    }

    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = {
            let state = self.state.lock().await;
            state.listen_targets.values().cloned().collect()
        };
        for target_data in targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let should_restart = {
            let mut state = self.state.lock().await;
            state.watch_change_aggregator = None;
            self.should_start_watch_stream(&state)
        };

        if should_restart {
            let error = error.unwrap_or_else(|| internal_error("Watch stream closed unexpectedly"));
            self.online_state_tracker
                .handle_watch_stream_failure(&error)
                .await;
            self.start_watch_stream().await
        } else {
            // Closed on purpose, or there is nothing left to listen to.
            self.online_state_tracker.set(OnlineState::Unknown).await;
            Ok(())
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        // Any message proves the backend is reachable.
        self.online_state_tracker.set(OnlineState::Online).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed
                && target_change.cause.is_some()
            {
                return self.handle_target_error(target_change).await;
            }
        }

        {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_change_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                debug!("[{LOG_TAG}] Dropping watch change received after the stream closed");
                return Ok(());
            };
            let metadata = ListenMetadata {
                listen_targets,
                syncer: self.syncer.as_ref(),
            };
            aggregator.handle_watch_change(&metadata, change);
        }

        if snapshot_version != SnapshotVersion::min() {
            let last_remote_snapshot_version =
                self.local_store.get_last_remote_snapshot_version().await?;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Turns everything aggregated so far into a remote event, records new
    /// resume tokens and re-listens to targets whose existence filter did not
    /// match.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let (event, relistens) = {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_change_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenMetadata {
                listen_targets,
                syncer: self.syncer.as_ref(),
            };
            let event = aggregator.create_remote_event(&metadata, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.get_mut(target_id) {
                    *target_data =
                        target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut relistens = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // Forget the token so the next listen replays the target from
                // scratch, while keeping the version that was acknowledged.
                *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                relistens.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, relistens)
        };

        for request in relistens {
            self.send_unwatch_request(request.target_id).await?;
            self.send_watch_request(request).await?;
        }
        self.syncer.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            let removed = {
                let mut state = self.state.lock().await;
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if removed {
                warn!("[{LOG_TAG}] Listen for target {target_id} rejected: {cause}");
                self.syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = {
            let state = self.state.lock().await;
            state
                .write_pipeline
                .back()
                .map(|batch| batch.batch_id)
                .unwrap_or(BATCH_ID_UNKNOWN)
        };

        loop {
            if !self.state.lock().await.can_add_to_write_pipeline() {
                break;
            }
            let Some(batch) = self.local_store.next_mutation_batch(Some(last_batch_id)).await? else {
                if self.state.lock().await.write_pipeline.is_empty() {
                    self.write_stream.mark_idle();
                }
                break;
            };
            last_batch_id = batch.batch_id;
            self.add_to_write_pipeline(batch).await?;
        }

        let should_start = {
            let state = self.state.lock().await;
            self.should_start_write_stream(&state)
        };
        if should_start {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let mutations = batch.mutations.clone();
        self.state.lock().await.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake().await
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        self.local_store
            .set_last_stream_token(self.write_stream.last_stream_token())
            .await?;
        let pending: Vec<_> = {
            let state = self.state.lock().await;
            state
                .write_pipeline
                .iter()
                .map(|batch| batch.mutations.clone())
                .collect()
        };
        for mutations in pending {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Err(internal_error("Got a write response without a pending batch"));
        };
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(error).await?;
            } else {
                self.handle_handshake_error(error).await?;
            }
        }

        let should_start = {
            let state = self.state.lock().await;
            self.should_start_write_stream(&state)
        };
        if should_start {
            self.write_stream.start();
        }
        Ok(())
    }

    /// A handshake rejected for good means the stream token is unusable.
    async fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_error(error.code) {
            return Ok(());
        }
        debug!("[{LOG_TAG}] Write stream handshake failed, resetting stream token: {error}");
        self.write_stream.set_last_stream_token(Vec::new());
        self.local_store.set_last_stream_token(Vec::new()).await
    }

    /// Rejects the head batch when the backend refused it for good; other
    /// errors are retried by restarting the stream.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        warn!(
            "[{LOG_TAG}] Batch {} rejected by the backend: {error}",
            batch.batch_id
        );
        // The failure was the batch's fault, not the connection's.
        self.write_stream.inhibit_backoff();
        self.syncer
            .reject_failed_write(batch.batch_id, error)
            .await?;
        self.fill_write_pipeline().await
    }
}

struct WatchListenerAdapter {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamListener for WatchListenerAdapter {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_change(change, snapshot_version).await,
            None => Ok(()),
        }
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

struct WriteListenerAdapter {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for WriteListenerAdapter {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_mutation_result(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}
