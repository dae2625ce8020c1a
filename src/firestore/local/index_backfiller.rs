use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::firestore::error::{FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::local_documents_view::{LocalDocumentsBatch, LocalDocumentsView};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::IndexOffset;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TAG: &str = "IndexBackfiller";

const MAX_DOCUMENTS_TO_PROCESS: usize = 50;
const INITIAL_BACKFILL_DELAY: Duration = Duration::from_secs(15);
const REGULAR_BACKFILL_DELAY: Duration = Duration::from_secs(60);

/// Fills the entries of configured field indexes for documents cached
/// before the index existed, a bounded number per run.
#[derive(Clone, Debug)]
pub struct IndexBackfiller {
    max_documents_to_process: usize,
}

impl Default for IndexBackfiller {
    fn default() -> Self {
        Self::new(MAX_DOCUMENTS_TO_PROCESS)
    }
}

impl IndexBackfiller {
    pub fn new(max_documents_to_process: usize) -> Self {
        Self {
            max_documents_to_process,
        }
    }

    /// Indexes up to the configured number of documents, least recently
    /// updated collection group first. Returns how many were processed.
    pub fn write_index_entries(
        &self,
        txn: &mut PersistenceTransaction,
        local_documents: &LocalDocumentsView,
    ) -> FirestoreResult<usize> {
        let index_manager = local_documents.index_manager();
        let mut processed_groups = BTreeSet::new();
        let mut remaining = self.max_documents_to_process;
        while remaining > 0 {
            let Some(collection_group) = index_manager.get_next_collection_group_to_update(txn) else {
                break;
            };
            if !processed_groups.insert(collection_group.clone()) {
                break;
            }
            debug!("[{LOG_TAG}] Processing collection group {collection_group}");
            let processed = self.write_entries_for_collection_group(
                txn,
                local_documents,
                &collection_group,
                remaining,
            )?;
            remaining = remaining.saturating_sub(processed);
        }
        Ok(self.max_documents_to_process - remaining)
    }

    fn write_entries_for_collection_group(
        &self,
        txn: &mut PersistenceTransaction,
        local_documents: &LocalDocumentsView,
        collection_group: &str,
        documents_remaining: usize,
    ) -> FirestoreResult<usize> {
        let index_manager = local_documents.index_manager();
        let existing_offset = index_manager.get_min_offset_from_collection_group(txn, collection_group);
        let next_batch = local_documents.get_next_documents(
            txn,
            collection_group,
            &existing_offset,
            documents_remaining,
        );
        index_manager.update_index_entries(txn, &next_batch.changes)?;

        let new_offset = new_offset(&existing_offset, &next_batch);
        debug!("[{LOG_TAG}] Updating offset of {collection_group} to {new_offset:?}");
        index_manager.update_collection_group(txn, collection_group, new_offset)?;
        Ok(next_batch.changes.len())
    }
}

fn new_offset(existing: &IndexOffset, batch: &LocalDocumentsBatch) -> IndexOffset {
    let mut max_offset = existing.clone();
    for document in batch.changes.values() {
        let offset = IndexOffset::from_document(document.read_time(), document.key());
        if offset > max_offset {
            max_offset = offset;
        }
    }
    IndexOffset {
        largest_batch_id: batch.batch_id.max(existing.largest_batch_id),
        ..max_offset
    }
}

/// Runs the backfiller periodically on the client's work queue.
#[derive(Clone)]
pub struct IndexBackfillerScheduler {
    inner: Arc<IndexBackfillerSchedulerInner>,
}

struct IndexBackfillerSchedulerInner {
    backfiller: IndexBackfiller,
    local_store: LocalStore,
    queue: AsyncQueue,
    task: Mutex<Option<DelayedOperation>>,
}

impl IndexBackfillerScheduler {
    pub fn new(backfiller: IndexBackfiller, local_store: LocalStore, queue: AsyncQueue) -> Self {
        Self {
            inner: Arc::new(IndexBackfillerSchedulerInner {
                backfiller,
                local_store,
                queue,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        self.schedule(INITIAL_BACKFILL_DELAY);
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock_task().is_some()
    }

    fn schedule(&self, delay: Duration) {
        debug!("[{LOG_TAG}] Scheduled in {delay:?}");
        let scheduler = self.clone();
        let task = self
            .inner
            .queue
            .enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
                scheduler.lock_task().take();
                let result = scheduler
                    .inner
                    .local_store
                    .backfill_indexes(&scheduler.inner.backfiller)
                    .await;
                match result {
                    Ok(processed) => debug!("[{LOG_TAG}] Documents written: {processed}"),
                    Err(err) if err.code == FirestoreErrorCode::Internal => {
                        warn!("[{LOG_TAG}] Stopping index backfill after internal error: {err}");
                        return Ok(());
                    }
                    Err(err) => debug!("[{LOG_TAG}] Ignoring error during index backfill: {err}"),
                }
                scheduler.schedule(REGULAR_BACKFILL_DELAY);
                Ok(())
            });
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
    use crate::firestore::core::query::{FieldFilter, FilterOperator, Query};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::index_manager::MemoryIndexManager;
    use crate::firestore::local::mutation_queue::MemoryMutationQueue;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{
        DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument,
        SnapshotVersion, Timestamp,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, count: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("count").unwrap(),
            FirestoreValue::from_integer(count),
        );
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), version(1), data)
    }

    fn view() -> LocalDocumentsView {
        LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MemoryMutationQueue::new("user"),
            DocumentOverlayCache::new("user"),
            MemoryIndexManager::new("user"),
        )
    }

    #[tokio::test]
    async fn backfills_in_bounded_steps() {
        let persistence = MemoryPersistence::new("client");
        let local_documents = view();
        let remote = RemoteDocumentCache::new();
        persistence
            .run_transaction("seed", PersistenceTransactionMode::ReadWrite, |txn| {
                for (index, path) in ["items/a", "items/b", "items/c"].into_iter().enumerate() {
                    remote.add_entry(txn, doc(path, index as i64), version(index as i64 + 1))?;
                }
                let index = FieldIndex::new(
                    "items",
                    vec![IndexSegment::new(
                        FieldPath::from_dot_separated("count").unwrap(),
                        IndexKind::Ascending,
                    )],
                );
                local_documents.index_manager().add_field_index(txn, index)?;
                Ok(())
            })
            .await
            .unwrap();

        let backfiller = IndexBackfiller::new(2);
        let mut processed = Vec::new();
        for _ in 0..3 {
            processed.push(
                persistence
                    .run_transaction("backfill", PersistenceTransactionMode::ReadWrite, |txn| {
                        backfiller.write_index_entries(txn, &local_documents)
                    })
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(processed, vec![2, 1, 0]);

        let query = Query::collection("items").unwrap().with_filter(
            FieldFilter::new(
                FieldPath::from_dot_separated("count").unwrap(),
                FilterOperator::GreaterThanOrEqual,
                FirestoreValue::from_integer(1),
            )
            .unwrap(),
        );
        let matches = persistence
            .run_transaction("read", PersistenceTransactionMode::ReadOnly, |txn| {
                Ok(local_documents
                    .index_manager()
                    .get_documents_matching_target(txn, &query.to_target()))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            matches,
            vec![
                DocumentKey::from_string("items/b").unwrap(),
                DocumentKey::from_string("items/c").unwrap()
            ]
        );
    }
}
