use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::firestore::core::types::{ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::firestore::error::{FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_reference_delegate::LruReferenceDelegate;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "LruGarbageCollector";

/// Threshold value that turns collection off.
pub const LRU_COLLECTION_DISABLED: i64 = -1;

pub const LRU_DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;

const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;
const DEFAULT_COLLECTION_DELAY: Duration = Duration::from_secs(60);

/// Tuning of the LRU collector.
#[derive(Clone, Debug, PartialEq)]
pub struct LruParams {
    /// Cache size in bytes below which no collection happens, or
    /// [`LRU_COLLECTION_DISABLED`].
    pub cache_size_collection_threshold: i64,
    /// Share of sequence numbers (targets and orphaned documents) collected
    /// per run.
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
    pub initial_collection_delay: Duration,
    pub regular_collection_delay: Duration,
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(LRU_COLLECTION_DISABLED)
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == LRU_COLLECTION_DISABLED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: LRU_DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
            initial_collection_delay: DEFAULT_COLLECTION_DELAY,
            regular_collection_delay: DEFAULT_COLLECTION_DELAY,
        }
    }
}

/// Outcome of one collection attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Removes the least recently used targets and the documents nothing
/// references anymore.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    delegate: LruReferenceDelegate,
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(delegate: LruReferenceDelegate, params: LruParams) -> Self {
        Self { delegate, params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// How many sequence numbers `percentile` percent of the cache covers.
    pub fn calculate_target_count(&self, txn: &PersistenceTransaction, percentile: u32) -> usize {
        let count = self.delegate.get_sequence_number_count(txn);
        (percentile as usize * count) / 100
    }

    /// The `n`th smallest sequence number in use, or
    /// [`INVALID_SEQUENCE_NUMBER`] for `n == 0`.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut sequence_numbers = self.delegate.target_sequence_numbers(txn);
        sequence_numbers.extend(self.delegate.orphaned_sequence_numbers(txn));
        sequence_numbers.sort_unstable();
        sequence_numbers
            .get(n - 1)
            .or_else(|| sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction) -> usize {
        self.delegate.get_cache_size(txn)
    }

    /// Runs a collection unless disabled or the cache is below the
    /// threshold. Targets in `active_target_ids` are never removed.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            debug!("[{LOG_TAG}] Garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = self.get_cache_size(txn) as i64;
        if cache_size < self.params.cache_size_collection_threshold {
            debug!(
                "[{LOG_TAG}] Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(txn, self.params.percentile_to_collect);
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            debug!(
                "[{LOG_TAG}] Capping sequence numbers to collect down to the maximum of {} from {sequence_numbers_to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }

        let upper_bound = self.nth_sequence_number(txn, sequence_numbers_to_collect);
        let targets_removed = self
            .delegate
            .remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.delegate.remove_orphaned_documents(txn, upper_bound)?;

        debug!(
            "[{LOG_TAG}] Collected up to sequence number {upper_bound}: \
             {sequence_numbers_to_collect} sequence numbers, {targets_removed} targets, \
             {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

/// Runs the collector periodically on the client's work queue.
#[derive(Clone)]
pub struct LruScheduler {
    inner: Arc<LruSchedulerInner>,
}

struct LruSchedulerInner {
    collector: LruGarbageCollector,
    local_store: LocalStore,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(collector: LruGarbageCollector, local_store: LocalStore, queue: AsyncQueue) -> Self {
        Self {
            inner: Arc::new(LruSchedulerInner {
                collector,
                local_store,
                queue,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.collector.params().is_disabled() {
            debug!("[{LOG_TAG}] Garbage collection disabled; not scheduling");
            return;
        }
        self.schedule_gc(self.inner.collector.params().initial_collection_delay);
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock_task().is_some()
    }

    fn schedule_gc(&self, delay: Duration) {
        debug!("[{LOG_TAG}] Garbage collection scheduled in {delay:?}");
        let scheduler = self.clone();
        let task = self.inner.queue.enqueue_after_delay(
            TimerId::LruGarbageCollection,
            delay,
            move || async move {
                scheduler.lock_task().take();
                let result = scheduler
                    .inner
                    .local_store
                    .collect_garbage(&scheduler.inner.collector)
                    .await;
                match result {
                    Ok(results) => debug!("[{LOG_TAG}] Collection finished: {results:?}"),
                    Err(err) if err.code == FirestoreErrorCode::Internal => {
                        warn!("[{LOG_TAG}] Stopping garbage collection after internal error: {err}");
                        return Ok(());
                    }
                    Err(err) => debug!("[{LOG_TAG}] Ignoring error during garbage collection: {err}"),
                }
                scheduler.schedule_gc(scheduler.inner.collector.params().regular_collection_delay);
                Ok(())
            },
        );
        *self.lock_task() = Some(task);
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<DelayedOperation>> {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::mutation_queue::MemoryMutationQueue;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::local::target_cache::TargetCache;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn collect_everything() -> LruParams {
        LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..LruParams::default()
        }
    }

    #[tokio::test]
    async fn disabled_collector_does_not_run() {
        let persistence = MemoryPersistence::new("client");
        let collector = LruGarbageCollector::new(LruReferenceDelegate::default(), LruParams::disabled());
        let results = persistence
            .run_transaction("gc", PersistenceTransactionMode::ReadWrite, |txn| {
                collector.collect(txn, &BTreeSet::new())
            })
            .await
            .unwrap();
        assert_eq!(results, LruResults::did_not_run());
    }

    #[tokio::test]
    async fn never_collects_referenced_documents() {
        let persistence = MemoryPersistence::new("client");
        let collector = LruGarbageCollector::new(LruReferenceDelegate::default(), collect_everything());
        let targets = TargetCache::new();
        let documents = RemoteDocumentCache::new();
        let queue = MemoryMutationQueue::new("user");

        persistence
            .run_transaction("seed", PersistenceTransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.current_sequence_number();
                for (target_id, path) in [(2, "active"), (4, "inactive")] {
                    let target = Query::collection(path)?.to_target();
                    targets.add_target_data(
                        txn,
                        TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number),
                    )?;
                }
                for path in ["active/a", "inactive/b", "pending/c", "orphan/d"] {
                    let document =
                        MutableDocument::new_found_document(key(path), version(1), MapValue::empty());
                    documents.add_entry(txn, document, version(1))?;
                }
                targets.add_matching_keys(txn, [&key("active/a")], 2)?;
                targets.add_matching_keys(txn, [&key("inactive/b")], 4)?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::delete(key("pending/c"))],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let active = BTreeSet::from([2]);
        let first = persistence
            .run_transaction("gc", PersistenceTransactionMode::ReadWrite, |txn| {
                collector.collect(txn, &active)
            })
            .await
            .unwrap();
        assert!(first.did_run);
        assert_eq!(first.targets_removed, 1);
        assert_eq!(first.documents_removed, 1);

        // The document of the removed target was orphaned by this run and
        // goes in the next one.
        let second = persistence
            .run_transaction("gc", PersistenceTransactionMode::ReadWrite, |txn| {
                collector.collect(txn, &active)
            })
            .await
            .unwrap();
        assert_eq!(second.targets_removed, 0);
        assert_eq!(second.documents_removed, 1);

        let remaining = persistence
            .run_transaction("read", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(documents.keys(txn))
            })
            .await
            .unwrap();
        assert_eq!(remaining, vec![key("active/a"), key("pending/c")]);
    }

    #[tokio::test]
    async fn caps_sequence_numbers_per_run() {
        let persistence = MemoryPersistence::new("client");
        let params = LruParams {
            maximum_sequence_numbers_to_collect: 3,
            ..collect_everything()
        };
        let collector = LruGarbageCollector::new(LruReferenceDelegate::default(), params);
        let targets = TargetCache::new();
        for target_id in 1..=10 {
            persistence
                .run_transaction("seed", PersistenceTransactionMode::ReadWrite, |txn| {
                    let target = Query::collection(format!("c{target_id}").as_str())?.to_target();
                    let sequence_number = txn.current_sequence_number();
                    targets.add_target_data(
                        txn,
                        TargetData::new(target, target_id * 2, TargetPurpose::Listen, sequence_number),
                    )
                })
                .await
                .unwrap();
        }

        let results = persistence
            .run_transaction("gc", PersistenceTransactionMode::ReadWrite, |txn| {
                collector.collect(txn, &BTreeSet::new())
            })
            .await
            .unwrap();
        assert_eq!(results.sequence_numbers_collected, 3);
        assert_eq!(results.targets_removed, 3);
    }
}
