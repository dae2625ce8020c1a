use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_lock::Mutex;
use log::{debug, warn};

use crate::firestore::core::query::{Query, Target};
use crate::firestore::core::types::TargetId;
use crate::firestore::error::{FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::index_manager::MemoryIndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::lru_reference_delegate::LruReferenceDelegate;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::persistence::{
    MemoryPersistence, PersistenceTransaction, PersistenceTransactionMode,
};
use crate::firestore::local::query_engine::{
    QueryEngine, DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
    DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldIndex, IndexOffset, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, Precondition, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

const LOG_TAG: &str = "LocalStore";

/// Resume tokens are persisted at least this often even when nothing else
/// about the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalStoreConfig {
    /// Let the query engine create field indexes for queries that scan far
    /// more documents than they return.
    pub auto_index_creation: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            auto_index_creation: false,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

impl LocalStoreConfig {
    pub fn with_auto_index_creation(mut self, enabled: bool) -> Self {
        self.auto_index_creation = enabled;
        self
    }

    pub fn with_index_auto_creation_min_collection_size(mut self, size: usize) -> Self {
        self.index_auto_creation_min_collection_size = size;
        self
    }

    pub fn with_relative_index_read_cost_per_document(mut self, cost: f64) -> Self {
        self.relative_index_read_cost_per_document = cost;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MutableDocument>,
}

/// Result of switching users: the documents whose local view may differ
/// and the batches that left or entered the queue.
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, MutableDocument>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents a view started or stopped showing, reported so the cache keeps
/// them while visible.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Components bound to the current user.
struct UserComponents {
    user_id: String,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
}

impl UserComponents {
    fn new(user_id: &str, config: &LocalStoreConfig, auto_index_creation: bool) -> Self {
        let local_documents = LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MemoryMutationQueue::new(user_id),
            DocumentOverlayCache::new(user_id),
            MemoryIndexManager::new(user_id),
        );
        let mut query_engine = QueryEngine::new(local_documents.clone());
        query_engine.set_index_auto_creation_enabled(auto_index_creation);
        query_engine.set_index_auto_creation_min_collection_size(
            config.index_auto_creation_min_collection_size,
        );
        query_engine
            .set_relative_index_read_cost_per_document(config.relative_index_read_cost_per_document);
        Self {
            user_id: user_id.to_string(),
            local_documents,
            query_engine,
        }
    }

    fn mutation_queue(&self) -> &MemoryMutationQueue {
        self.local_documents.mutation_queue()
    }
}

struct LocalStoreState {
    user: UserComponents,
    auto_index_creation: bool,
    /// Targets with an active listener, by id.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
    /// Highest read time seen per collection group, for change polling.
    collection_group_read_time: BTreeMap<String, SnapshotVersion>,
}

/// Local view of the database: applies local writes and remote changes to
/// the cache and answers queries from it.
///
/// Every operation runs in one persistence transaction; calls on the same
/// store are serialized.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalStoreInner>,
}

struct LocalStoreInner {
    persistence: MemoryPersistence,
    config: LocalStoreConfig,
    remote_document_cache: RemoteDocumentCache,
    target_cache: TargetCache,
    bundle_cache: BundleCache,
    local_view_references: Arc<StdMutex<ReferenceSet>>,
    reference_delegate: LruReferenceDelegate,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: MemoryPersistence, user_id: &str, config: LocalStoreConfig) -> Self {
        let local_view_references = Arc::new(StdMutex::new(ReferenceSet::new()));
        let reference_delegate = LruReferenceDelegate::new(Arc::clone(&local_view_references));
        let state = LocalStoreState {
            user: UserComponents::new(user_id, &config, config.auto_index_creation),
            auto_index_creation: config.auto_index_creation,
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
            collection_group_read_time: BTreeMap::new(),
        };
        Self {
            inner: Arc::new(LocalStoreInner {
                persistence,
                config,
                remote_document_cache: RemoteDocumentCache::new(),
                target_cache: TargetCache::new(),
                bundle_cache: BundleCache::new(),
                local_view_references,
                reference_delegate,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn persistence(&self) -> &MemoryPersistence {
        &self.inner.persistence
    }

    /// Delegate to build an [`LruGarbageCollector`] for this store.
    pub fn reference_delegate(&self) -> &LruReferenceDelegate {
        &self.inner.reference_delegate
    }

    pub async fn current_user(&self) -> String {
        self.inner.state.lock().await.user.user_id.clone()
    }

    /// Switches to `user_id`'s mutation queue and reports which documents
    /// may look different now.
    pub async fn handle_user_change(&self, user_id: &str) -> FirestoreResult<UserChangeResult> {
        let mut state = self.inner.state.lock().await;
        let new_user = UserComponents::new(user_id, &self.inner.config, state.auto_index_creation);
        let old_queue = state.user.mutation_queue().clone();
        let result = self
            .inner
            .persistence
            .run_transaction("Handle user change", PersistenceTransactionMode::ReadOnly, |txn| {
                let old_batches = old_queue.get_all_mutation_batches(txn);
                let new_batches = new_user.mutation_queue().get_all_mutation_batches(txn);
                let changed_keys: BTreeSet<DocumentKey> = old_batches
                    .iter()
                    .chain(new_batches.iter())
                    .flat_map(MutationBatch::keys)
                    .collect();
                Ok(UserChangeResult {
                    affected_documents: new_user
                        .local_documents
                        .get_documents(txn, changed_keys.iter()),
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;
        debug!("[{LOG_TAG}] Switched user from '{}' to '{user_id}'", state.user.user_id);
        state.user = new_user;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the documents as they
    /// look with the batch applied.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();
        let state = self.inner.state.lock().await;
        let local_documents = &state.user.local_documents;
        self.inner
            .persistence
            .run_transaction("Locally write mutations", PersistenceTransactionMode::ReadWrite, |txn| {
                let remote_documents = self.inner.remote_document_cache.get_entries(txn, keys.iter());
                let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = local_documents.get_overlayed_documents(txn, remote_documents)?;

                // Transforms like increments are recorded against the value
                // the user saw, so replays produce the same result.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let document = &overlayed.get(mutation.key())?.document;
                        let data = mutation.extract_transform_base_value(document)?;
                        Some(Mutation::Patch {
                            key: mutation.key().clone(),
                            field_mask: data.field_mask(),
                            data,
                            precondition: Precondition::Exists(true),
                            field_transforms: Vec::new(),
                        })
                    })
                    .collect();

                let batch = local_documents.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations,
                )?;
                let overlays =
                    batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                local_documents
                    .document_overlay_cache()
                    .save_overlays(txn, batch.batch_id, overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies the server's acknowledgement of a batch: the written
    /// documents adopt the committed versions and the batch leaves the
    /// queue. Acknowledging a batch that is already gone changes nothing.
    pub async fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let state = self.inner.state.lock().await;
        let local_documents = &state.user.local_documents;
        self.inner
            .persistence
            .run_transaction("Acknowledge batch", PersistenceTransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let mutation_queue = local_documents.mutation_queue();
                if mutation_queue.lookup_mutation_batch(txn, batch.batch_id).is_none() {
                    debug!("[{LOG_TAG}] Batch {} was already removed", batch.batch_id);
                    return Ok(BTreeMap::new());
                }
                let affected = batch.keys();
                self.apply_write_to_remote_documents(txn, mutation_queue, batch_result)?;
                mutation_queue.perform_consistency_check(txn)?;
                local_documents.document_overlay_cache().remove_overlays_for_batch_id(
                    txn,
                    affected.iter(),
                    batch.batch_id,
                )?;
                let with_transform_results = keys_with_transform_results(batch_result);
                local_documents
                    .recalculate_and_save_overlays_for_document_keys(txn, with_transform_results.iter())?;
                Ok(local_documents.get_documents(txn, affected.iter()))
            })
            .await
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction,
        mutation_queue: &MemoryMutationQueue,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        let keys = batch.keys();
        for key in &keys {
            let mut document = self.inner.remote_document_cache.get_entry(txn, key);
            let Some(ack_version) = batch_result.doc_versions.get(key) else {
                continue;
            };
            if document.version() < *ack_version {
                batch.apply_to_remote_document(&mut document, batch_result);
                if document.is_valid_document() {
                    self.inner
                        .remote_document_cache
                        .add_entry(txn, document, batch_result.commit_version)?;
                }
            }
        }
        mutation_queue.acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
        self.remove_mutation_batch(txn, mutation_queue, batch)
    }

    fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        mutation_queue: &MemoryMutationQueue,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        mutation_queue.remove_mutation_batch(txn, batch)?;
        for key in batch.keys() {
            self.inner
                .reference_delegate
                .remove_mutation_reference(txn, &key)?;
        }
        Ok(())
    }

    /// Drops a batch the backend refused and restores the local view of
    /// the documents it touched.
    pub async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let state = self.inner.state.lock().await;
        let local_documents = &state.user.local_documents;
        self.inner
            .persistence
            .run_transaction("Reject batch", PersistenceTransactionMode::ReadWritePrimary, |txn| {
                let mutation_queue = local_documents.mutation_queue();
                let Some(batch) = mutation_queue.lookup_mutation_batch(txn, batch_id) else {
                    debug!("[{LOG_TAG}] Batch {batch_id} was already removed");
                    return Ok(BTreeMap::new());
                };
                let affected = batch.keys();
                self.remove_mutation_batch(txn, mutation_queue, &batch)?;
                mutation_queue.perform_consistency_check(txn)?;
                local_documents.document_overlay_cache().remove_overlays_for_batch_id(
                    txn,
                    affected.iter(),
                    batch_id,
                )?;
                local_documents.recalculate_and_save_overlays_for_document_keys(txn, affected.iter())?;
                Ok(local_documents.get_documents(txn, affected.iter()))
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let state = self.inner.state.lock().await;
        let mutation_queue = state.user.mutation_queue();
        self.inner
            .persistence
            .run_transaction(
                "Get highest unacknowledged batch id",
                PersistenceTransactionMode::ReadOnly,
                |txn| Ok(mutation_queue.get_highest_unacknowledged_batch_id(txn)),
            )
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let state = self.inner.state.lock().await;
        let mutation_queue = state.user.mutation_queue();
        self.inner
            .persistence
            .run_transaction("Get last stream token", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(mutation_queue.last_stream_token(txn))
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let state = self.inner.state.lock().await;
        let mutation_queue = state.user.mutation_queue();
        self.inner
            .persistence
            .run_transaction(
                "Set last stream token",
                PersistenceTransactionMode::ReadWritePrimary,
                |txn| mutation_queue.set_last_stream_token(txn, stream_token),
            )
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.inner
            .persistence
            .run_transaction(
                "Get last remote snapshot version",
                PersistenceTransactionMode::ReadOnly,
                |txn| Ok(self.inner.target_cache.get_last_remote_snapshot_version(txn)),
            )
            .await
    }

    /// Applies an aggregated watch event to the cache and returns the local
    /// view of every document it changed.
    pub async fn apply_remote_event(
        &self,
        remote_event: &RemoteEvent,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.inner.state.lock().await;
        let remote_version = remote_event.snapshot_version;
        let local_documents = state.user.local_documents.clone();
        let active_targets = &state.target_data_by_target;
        let target_cache = &self.inner.target_cache;

        let (changes, updated_targets) = self
            .inner
            .persistence
            .run_transaction("Apply remote event", PersistenceTransactionMode::ReadWritePrimary, |txn| {
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &remote_event.target_changes {
                    // Only targets that are still listened to are updated.
                    let Some(old_target_data) = active_targets.get(target_id) else {
                        continue;
                    };
                    target_cache.remove_matching_keys(txn, change.removed_documents.iter(), *target_id)?;
                    target_cache.add_matching_keys(txn, change.added_documents.iter(), *target_id)?;

                    let mut new_target_data =
                        old_target_data.with_sequence_number(txn.current_sequence_number());
                    if remote_event.target_mismatches.contains_key(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data =
                            new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(old_target_data, &new_target_data, change) {
                        target_cache.update_target_data(txn, new_target_data.clone())?;
                    }
                    updated_targets.insert(*target_id, new_target_data);
                }

                for key in remote_event.document_updates.keys() {
                    if remote_event.resolved_limbo_documents.contains(key) {
                        self.inner.reference_delegate.update_limbo_document(txn, key)?;
                    }
                }
                let (changed_documents, existence_changed) =
                    self.populate_document_changes(txn, &remote_event.document_updates, remote_version)?;

                if !remote_version.is_min() {
                    let last_remote_version = target_cache.get_last_remote_snapshot_version(txn);
                    if remote_version < last_remote_version {
                        warn!(
                            "[{LOG_TAG}] Ignoring remote version {remote_version:?} older than {last_remote_version:?}"
                        );
                    } else {
                        target_cache.set_target_globals(
                            txn,
                            txn.current_sequence_number(),
                            Some(remote_version),
                        )?;
                    }
                }

                let changes = local_documents.get_local_view_of_documents(
                    txn,
                    changed_documents,
                    &existence_changed,
                )?;
                Ok((changes, updated_targets))
            })
            .await?;

        state.target_data_by_target.extend(updated_targets);
        Ok(changes)
    }

    /// Writes remote documents into the cache unless the cached version is
    /// newer. Returns the changed documents and the keys whose existence
    /// flipped.
    fn populate_document_changes(
        &self,
        txn: &mut PersistenceTransaction,
        documents: &BTreeMap<DocumentKey, MutableDocument>,
        remote_version: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MutableDocument>, BTreeSet<DocumentKey>)> {
        let cache = &self.inner.remote_document_cache;
        let existing_documents = cache.get_entries(txn, documents.keys());
        let mut changed = BTreeMap::new();
        let mut existence_changed = BTreeSet::new();
        for (key, document) in documents {
            let existing = existing_documents
                .get(key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));
            if document.is_found_document() != existing.is_found_document() {
                existence_changed.insert(key.clone());
            }

            // A deleted document at version zero stands for lost access;
            // it is removed from the cache rather than stored.
            if document.is_no_document() && document.version().is_min() {
                cache.remove_entry(txn, key)?;
                changed.insert(key.clone(), document.clone());
            } else if !existing.is_valid_document()
                || document.version() > existing.version()
                || (document.version() == existing.version() && existing.has_pending_writes())
            {
                let read_time = if document.read_time().is_min() {
                    remote_version
                } else {
                    document.read_time()
                };
                cache.add_entry(txn, document.clone(), read_time)?;
                changed.insert(key.clone(), document.clone());
            } else {
                debug!(
                    "[{LOG_TAG}] Ignoring outdated watch update for {key}. Current version: {:?}, watch version: {:?}",
                    existing.version(),
                    document.version()
                );
            }
        }
        Ok((changed, existence_changed))
    }

    /// Records which documents each view shows so they stay cached, and
    /// advances the limbo-free version of views synced with the backend.
    pub async fn notify_local_view_changes(
        &self,
        view_changes: &[LocalViewChanges],
    ) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        let delegate = &self.inner.reference_delegate;
        self.inner
            .persistence
            .run_transaction("Notify local view changes", PersistenceTransactionMode::ReadWrite, |txn| {
                for change in view_changes {
                    for key in &change.removed_keys {
                        delegate.remove_reference(txn, change.target_id, key)?;
                    }
                    for key in &change.added_keys {
                        delegate.add_reference(txn, change.target_id, key)?;
                    }
                }
                Ok(())
            })
            .await?;

        {
            let mut references = self.local_view_references();
            for change in view_changes {
                references.add_references(change.added_keys.iter(), change.target_id);
                references.remove_references(change.removed_keys.iter(), change.target_id);
            }
        }

        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = state.target_data_by_target.get_mut(&change.target_id) {
                // The view is consistent with the backend as of this version.
                *target_data =
                    target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            }
        }
        Ok(())
    }

    /// First batch after `after_batch_id` (or the first batch), for the
    /// write pipeline.
    pub async fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.inner.state.lock().await;
        let mutation_queue = state.user.mutation_queue();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.inner
            .persistence
            .run_transaction("Get next mutation batch", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(mutation_queue.get_next_mutation_batch_after_batch_id(txn, after))
            })
            .await
    }

    pub async fn lookup_mutation_batch(&self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.inner.state.lock().await;
        let mutation_queue = state.user.mutation_queue();
        self.inner
            .persistence
            .run_transaction("Lookup mutation batch", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(mutation_queue.lookup_mutation_batch(txn, batch_id))
            })
            .await
    }

    /// Local view of one document, pending writes included.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let state = self.inner.state.lock().await;
        let local_documents = &state.user.local_documents;
        self.inner
            .persistence
            .run_transaction("Read document", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(local_documents.get_document(txn, key))
            })
            .await
    }

    /// Target data for `target`, allocating and persisting a new target when
    /// none is cached.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.inner.state.lock().await;
        let canonical_id = target.canonical_id();
        if let Some(cached) = state
            .target_id_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| state.target_data_by_target.get(target_id))
        {
            return Ok(cached.clone());
        }

        let target_cache = &self.inner.target_cache;
        let target_data = self
            .inner
            .persistence
            .run_transaction("Allocate target", PersistenceTransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target) {
                    return Ok(cached);
                }
                let target_id = target_cache.allocate_target_id(txn)?;
                let target_data = TargetData::new(
                    target,
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                target_cache.add_target_data(txn, target_data.clone())?;
                Ok(target_data)
            })
            .await?;

        state
            .target_data_by_target
            .entry(target_data.target_id)
            .or_insert_with(|| target_data.clone());
        state
            .target_id_by_canonical_id
            .insert(canonical_id, target_data.target_id);
        Ok(target_data)
    }

    /// Target data of an active target.
    pub async fn get_target_data(&self, target_id: TargetId) -> Option<TargetData> {
        self.inner
            .state
            .lock()
            .await
            .target_data_by_target
            .get(&target_id)
            .cloned()
    }

    /// Stops tracking an active target. Unless `keep_persisted_target_data`
    /// is set, the target becomes eligible for garbage collection.
    pub async fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            debug!("[{LOG_TAG}] Ignoring release of inactive target {target_id}");
            return Ok(());
        };

        let removed = self.local_view_references().remove_references_for_id(target_id);
        let mode = if keep_persisted_target_data {
            PersistenceTransactionMode::ReadWrite
        } else {
            PersistenceTransactionMode::ReadWritePrimary
        };
        let delegate = &self.inner.reference_delegate;
        let result = self
            .inner
            .persistence
            .run_transaction("Release target", mode, |txn| {
                for key in &removed {
                    delegate.remove_reference(txn, target_id, key)?;
                }
                if !keep_persisted_target_data {
                    delegate.remove_target(txn, &target_data)?;
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => {}
            Err(err) if err.code == FirestoreErrorCode::FailedPrecondition => {
                debug!("[{LOG_TAG}] Failed to update sequence numbers for target {target_id}: {err}");
            }
            Err(err) => return Err(err),
        }

        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results`
    /// the keys of the last synced result are reused when still valid.
    pub async fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let mut state = self.inner.state.lock().await;
        let target = query.to_target();
        let active = state
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .cloned();
        let target_cache = &self.inner.target_cache;
        let query_engine = &state.user.query_engine;

        let result = self
            .inner
            .persistence
            .run_transaction("Execute query", PersistenceTransactionMode::ReadWrite, |txn| {
                let target_data = active.or_else(|| target_cache.get_target_data(txn, &target));
                let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, data.target_id),
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(
                        txn,
                        query,
                        last_limbo_free_snapshot_version,
                        &remote_keys,
                    )?
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        query,
                        SnapshotVersion::min(),
                        &BTreeSet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
            .await?;

        let collection_group = query_collection_group(query);
        track_read_time(&mut state, &collection_group, result.documents.values());
        Ok(result)
    }

    /// Documents of `collection_group` read since the last query or poll,
    /// with pending writes applied.
    pub async fn get_new_document_changes(
        &self,
        collection_group: &str,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut state = self.inner.state.lock().await;
        let read_time = state
            .collection_group_read_time
            .get(collection_group)
            .copied()
            .unwrap_or_else(SnapshotVersion::min);
        let local_documents = &state.user.local_documents;
        let cache = &self.inner.remote_document_cache;
        let changes = self
            .inner
            .persistence
            .run_transaction("Get new document changes", PersistenceTransactionMode::ReadOnly, |txn| {
                let documents = cache.get_all_from_collection_group(
                    txn,
                    collection_group,
                    &IndexOffset::from_read_time(read_time),
                    usize::MAX,
                );
                let keys: Vec<DocumentKey> = documents.iter().map(|doc| doc.key().clone()).collect();
                let view = local_documents.get_documents(txn, keys.iter());
                Ok(view)
            })
            .await?;
        track_read_time(&mut state, collection_group, changes.values());
        Ok(changes)
    }

    /// Keys the backend last reported for `target_id`.
    pub async fn get_remote_document_keys(
        &self,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.inner
            .persistence
            .run_transaction("Remote document keys", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(self
                    .inner
                    .target_cache
                    .get_matching_keys_for_target_id(txn, target_id))
            })
            .await
    }

    /// Replaces the configured field indexes with `field_indexes`.
    pub async fn configure_field_indexes(&self, field_indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let state = self.inner.state.lock().await;
        let index_manager = state.user.local_documents.index_manager();
        self.inner
            .persistence
            .run_transaction("Configure indexes", PersistenceTransactionMode::ReadWrite, |txn| {
                let existing = index_manager.get_field_indexes(txn, None);
                for index in &existing {
                    if !field_indexes.iter().any(|wanted| wanted.same_definition(index)) {
                        index_manager.delete_field_index(txn, index)?;
                    }
                }
                for index in field_indexes {
                    if !existing.iter().any(|current| current.same_definition(&index)) {
                        index_manager.add_field_index(txn, index)?;
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.auto_index_creation = enabled;
        state.user.query_engine.set_index_auto_creation_enabled(enabled);
    }

    /// Removes every field index and its entries.
    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.configure_field_indexes(Vec::new()).await
    }

    /// Writes index entries for documents cached before their index existed.
    pub async fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        let state = self.inner.state.lock().await;
        let local_documents = &state.user.local_documents;
        self.inner
            .persistence
            .run_transaction("Backfill indexes", PersistenceTransactionMode::ReadWrite, |txn| {
                backfiller.write_index_entries(txn, local_documents)
            })
            .await
    }

    /// Runs one LRU collection; targets with listeners are kept.
    pub async fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let state = self.inner.state.lock().await;
        let active_target_ids: BTreeSet<TargetId> =
            state.target_data_by_target.keys().copied().collect();
        self.inner
            .persistence
            .run_transaction("Collect garbage", PersistenceTransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &active_target_ids)
            })
            .await
    }

    /// Whether a bundle at least as new as `metadata` was loaded before.
    pub async fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.inner
            .persistence
            .run_transaction("Has newer bundle", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(self
                    .inner
                    .bundle_cache
                    .get_bundle_metadata(txn, &metadata.bundle_id)
                    .map(|cached| cached.create_time >= metadata.create_time)
                    .unwrap_or(false))
            })
            .await
    }

    pub async fn save_bundle(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.inner
            .persistence
            .run_transaction("Save bundle", PersistenceTransactionMode::ReadWrite, |txn| {
                self.inner.bundle_cache.save_bundle_metadata(txn, metadata)
            })
            .await
    }

    pub async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.inner
            .persistence
            .run_transaction("Get named query", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(self.inner.bundle_cache.get_named_query(txn, name))
            })
            .await
    }

    /// Saves a bundled query and, when its read time is newer than what the
    /// target has, adopts `documents` as the target's result.
    pub async fn save_named_query(
        &self,
        named_query: NamedQuery,
        documents: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let allocated = self.allocate_target(named_query.query.to_target()).await?;
        let target_cache = &self.inner.target_cache;
        let bundle_cache = &self.inner.bundle_cache;
        let updated = self
            .inner
            .persistence
            .run_transaction("Save named query", PersistenceTransactionMode::ReadWrite, |txn| {
                let target_id = allocated.target_id;
                if allocated.snapshot_version >= named_query.read_time {
                    bundle_cache.save_named_query(txn, named_query)?;
                    return Ok(None);
                }
                let updated = allocated.with_resume_token(Vec::new(), named_query.read_time);
                target_cache.update_target_data(txn, updated.clone())?;
                target_cache.remove_matching_keys_for_target_id(txn, target_id)?;
                target_cache.add_matching_keys(txn, documents.iter(), target_id)?;
                bundle_cache.save_named_query(txn, named_query)?;
                Ok(Some(updated))
            })
            .await?;

        if let Some(updated) = updated {
            let mut state = self.inner.state.lock().await;
            state.target_data_by_target.insert(updated.target_id, updated);
        }
        Ok(())
    }

    fn local_view_references(&self) -> std::sync::MutexGuard<'_, ReferenceSet> {
        self.inner
            .local_view_references
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    // Always persist target data if there is no resume token yet, or the
    // token was just cleared by a reset.
    if old_target_data.resume_token.is_empty() || new_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = micros(new_target_data.snapshot_version) - micros(old_target_data.snapshot_version);
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

fn micros(version: SnapshotVersion) -> i64 {
    let timestamp = version.timestamp();
    timestamp.seconds * 1_000_000 + i64::from(timestamp.nanos) / 1_000
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> BTreeSet<DocumentKey> {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(batch_result.mutation_results.iter())
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

fn query_collection_group(query: &Query) -> String {
    query
        .collection_group_id()
        .or_else(|| query.path().last_segment())
        .unwrap_or_default()
        .to_string()
}

fn track_read_time<'a, I>(state: &mut LocalStoreState, collection_group: &str, documents: I)
where
    I: IntoIterator<Item = &'a MutableDocument>,
{
    let latest = documents.into_iter().map(MutableDocument::read_time).max();
    if let Some(latest) = latest {
        let entry = state
            .collection_group_read_time
            .entry(collection_group.to_string())
            .or_insert_with(SnapshotVersion::min);
        if latest > *entry {
            *entry = latest;
        }
    }
}
