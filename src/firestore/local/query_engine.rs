use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexType;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};

const LOG_TAG: &str = "QueryEngine";

/// Collections smaller than this never get an index created automatically.
pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;

/// Reading a document through an index is assumed to cost this many times a
/// plain scan read.
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

/// Counters collected while a query runs.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    documents_read_count: usize,
}

impl QueryContext {
    pub fn documents_read_count(&self) -> usize {
        self.documents_read_count
    }

    pub fn increment_documents_read_count(&mut self, count: usize) {
        self.documents_read_count += count;
    }
}

/// Picks the cheapest way to answer a query from the local cache: a field
/// index, the previous result set, or a full collection scan.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
    index_auto_creation_enabled: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: f64,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView) -> Self {
        Self {
            local_documents,
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation_enabled = enabled;
    }

    pub fn set_index_auto_creation_min_collection_size(&mut self, size: usize) {
        self.index_auto_creation_min_collection_size = size;
    }

    pub fn set_relative_index_read_cost_per_document(&mut self, cost: f64) {
        self.relative_index_read_cost_per_document = cost;
    }

    /// Documents in the local view matching `query`, limit not applied.
    ///
    /// `remote_keys` are the keys the backend last reported for the query's
    /// target, valid as of `last_limbo_free_snapshot_version`.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        if let Some(result) = self.perform_query_using_index(txn, query) {
            return Ok(result);
        }
        if let Some(result) = self.perform_query_using_remote_keys(
            txn,
            query,
            remote_keys,
            last_limbo_free_snapshot_version,
        ) {
            return Ok(result);
        }

        let mut context = QueryContext::default();
        let result = self.local_documents.get_documents_matching_query(
            txn,
            query,
            &IndexOffset::none(),
            Some(&mut context),
        );
        if self.index_auto_creation_enabled {
            self.create_cache_indexes(txn, query, &context, result.len())?;
        }
        Ok(result)
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let read_count = context.documents_read_count();
        if read_count < self.index_auto_creation_min_collection_size {
            debug!(
                "[{LOG_TAG}] Skipping index creation for {query}: only {read_count} documents scanned"
            );
            return Ok(());
        }
        debug!(
            "[{LOG_TAG}] Query {query} scanned {read_count} documents and returned {result_size}"
        );
        if read_count as f64 > self.relative_index_read_cost_per_document * result_size as f64 {
            self.local_documents
                .index_manager()
                .create_target_indexes(txn, &query.to_target())?;
            debug!("[{LOG_TAG}] Created index for {query}");
        }
        Ok(())
    }

    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() {
            // A full scan of the collection is as cheap as an index scan.
            return None;
        }
        let index_manager = self.local_documents.index_manager();
        let target = query.to_target();
        let index_type = index_manager.get_index_type(txn, &target);
        if index_type == IndexType::None {
            return None;
        }
        if query.has_limit() && index_type == IndexType::Partial {
            // A partial index may leave out documents the limit would keep.
            return self.perform_query_using_index(txn, &query.without_limit());
        }

        let keys = index_manager.get_documents_matching_target(txn, &target)?;
        let sorted_keys: BTreeSet<DocumentKey> = keys.into_iter().collect();
        let indexed = self.local_documents.get_documents(txn, sorted_keys.iter());
        let offset = index_manager.get_min_offset(txn, &target);
        let previous_results = apply_query(query, indexed);
        if needs_refill(query, &previous_results, &sorted_keys, offset.read_time) {
            return self.perform_query_using_index(txn, &query.without_limit());
        }
        debug!(
            "[{LOG_TAG}] Using index for {query} with {} candidates",
            previous_results.len()
        );
        Some(self.append_remaining_results(txn, previous_results, query, &offset))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> Option<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() {
            return None;
        }
        // Results from a target that was never in sync cannot be reused.
        if last_limbo_free_snapshot_version.is_min() {
            return None;
        }
        let documents = self.local_documents.get_documents(txn, remote_keys.iter());
        let previous_results = apply_query(query, documents);
        if needs_refill(
            query,
            &previous_results,
            remote_keys,
            last_limbo_free_snapshot_version,
        ) {
            return None;
        }
        debug!(
            "[{LOG_TAG}] Re-using previous result from {last_limbo_free_snapshot_version} to execute {query}"
        );
        Some(self.append_remaining_results(
            txn,
            previous_results,
            query,
            &IndexOffset::from_read_time(last_limbo_free_snapshot_version),
        ))
    }

    /// Documents changed after `offset` combined with the earlier results.
    fn append_remaining_results(
        &self,
        txn: &PersistenceTransaction,
        previous_results: Vec<MutableDocument>,
        query: &Query,
        offset: &IndexOffset,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let mut remaining = self
            .local_documents
            .get_documents_matching_query(txn, query, offset, None);
        for document in previous_results {
            remaining.insert(document.key().clone(), document);
        }
        remaining
    }
}

/// Matching documents in query order, limit not applied.
fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, MutableDocument>) -> Vec<MutableDocument> {
    let mut results: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| query.compare_documents(left, right));
    results
}

/// Whether a limit query has to be re-run from scratch because a document
/// may have entered or left its window since the previous results were
/// computed.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    let Some(_) = query.limit() else {
        return false;
    };
    if remote_keys.len() != sorted_previous_results.len() {
        // A document stopped matching; the next one past the limit is unknown.
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{FieldFilter, FilterOperator};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::index_manager::MemoryIndexManager;
    use crate::firestore::local::mutation_queue::MemoryMutationQueue;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, matches: bool, at: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("matches").unwrap(),
            FirestoreValue::from_bool(matches),
        );
        MutableDocument::new_found_document(key(path), version(at), data)
    }

    fn matching_query() -> Query {
        Query::collection("coll").unwrap().with_filter(
            FieldFilter::new(
                FieldPath::from_dot_separated("matches").unwrap(),
                FilterOperator::Equal,
                FirestoreValue::from_bool(true),
            )
            .unwrap(),
        )
    }

    fn engine() -> QueryEngine {
        QueryEngine::new(LocalDocumentsView::new(
            RemoteDocumentCache::new(),
            MemoryMutationQueue::new("user"),
            DocumentOverlayCache::new("user"),
            MemoryIndexManager::new("user"),
        ))
    }

    async fn seed(persistence: &MemoryPersistence, documents: Vec<MutableDocument>) {
        let cache = RemoteDocumentCache::new();
        persistence
            .run_transaction("seed", PersistenceTransactionMode::ReadWrite, |txn| {
                for document in documents {
                    let read_time = document.version();
                    cache.add_entry(txn, document, read_time)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_scan_without_previous_results() {
        let persistence = MemoryPersistence::new("client");
        seed(
            &persistence,
            vec![doc("coll/a", true, 1), doc("coll/b", false, 1)],
        )
        .await;
        let engine = engine();
        let results = persistence
            .run_transaction("query", PersistenceTransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(
                    txn,
                    &matching_query(),
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )
            })
            .await
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("coll/a")]);
    }

    #[tokio::test]
    async fn reuses_previous_results_and_appends_newer_documents() {
        let persistence = MemoryPersistence::new("client");
        // coll/old matches but was not among the remote keys; being older
        // than the limbo-free version it must not be picked up again.
        seed(
            &persistence,
            vec![
                doc("coll/a", true, 1),
                doc("coll/old", true, 1),
                doc("coll/new", true, 3),
            ],
        )
        .await;
        let engine = engine();
        let remote_keys = BTreeSet::from([key("coll/a")]);
        let results = persistence
            .run_transaction("query", PersistenceTransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(txn, &matching_query(), version(2), &remote_keys)
            })
            .await
            .unwrap();
        assert_eq!(
            results.keys().cloned().collect::<Vec<_>>(),
            vec![key("coll/a"), key("coll/new")]
        );
    }

    #[tokio::test]
    async fn limit_query_refills_when_edge_document_changed() {
        let persistence = MemoryPersistence::new("client");
        seed(
            &persistence,
            vec![doc("coll/a", true, 1), doc("coll/b", true, 3)],
        )
        .await;
        let engine = engine();
        let query = matching_query().with_limit_to_first(1);
        let remote_keys = BTreeSet::from([key("coll/b")]);
        let results = persistence
            .run_transaction("query", PersistenceTransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(txn, &query, version(2), &remote_keys)
            })
            .await
            .unwrap();
        // The edge document is newer than the limbo-free version, so the
        // engine falls back to a scan and finds coll/a too.
        assert!(results.contains_key(&key("coll/a")));
    }

    #[tokio::test]
    async fn auto_creates_index_for_selective_scans() {
        let persistence = MemoryPersistence::new("client");
        let documents = (0..10)
            .map(|i| doc(&format!("coll/{i}"), i == 0, 1))
            .collect();
        seed(&persistence, documents).await;
        let mut engine = engine();
        engine.set_index_auto_creation_enabled(true);
        engine.set_index_auto_creation_min_collection_size(5);
        let index_manager = MemoryIndexManager::new("user");
        let target = matching_query().to_target();
        let (before, after) = persistence
            .run_transaction("query", PersistenceTransactionMode::ReadWrite, |txn| {
                let before = index_manager.get_index_type(txn, &target);
                engine.get_documents_matching_query(
                    txn,
                    &matching_query(),
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?;
                Ok((before, index_manager.get_index_type(txn, &target)))
            })
            .await
            .unwrap();
        assert_eq!(before, IndexType::None);
        assert_eq!(after, IndexType::Full);
    }
}
