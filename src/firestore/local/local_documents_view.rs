use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::MemoryIndexManager;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, IndexOffset, MutableDocument,
    Mutation, Overlay, OverlayedDocument, Timestamp, BATCH_ID_UNKNOWN,
};

/// Documents read from the backfill cursor together with the largest batch
/// whose overlays were included.
#[derive(Clone, Debug, Default)]
pub struct LocalDocumentsBatch {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, MutableDocument>,
}

/// Read side of the local store: the remote document cache with every
/// pending write of the current user applied on top.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_document_cache: RemoteDocumentCache,
    mutation_queue: MemoryMutationQueue,
    document_overlay_cache: DocumentOverlayCache,
    index_manager: MemoryIndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: RemoteDocumentCache,
        mutation_queue: MemoryMutationQueue,
        document_overlay_cache: DocumentOverlayCache,
        index_manager: MemoryIndexManager,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            document_overlay_cache,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MemoryMutationQueue {
        &self.mutation_queue
    }

    pub fn document_overlay_cache(&self) -> &DocumentOverlayCache {
        &self.document_overlay_cache
    }

    pub fn remote_document_cache(&self) -> &RemoteDocumentCache {
        &self.remote_document_cache
    }

    pub fn index_manager(&self) -> &MemoryIndexManager {
        &self.index_manager
    }

    /// Local view of one document: the remote version plus its overlay.
    pub fn get_document(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> MutableDocument {
        let mut document = self.remote_document_cache.get_entry(txn, key);
        if let Some(overlay) = self.document_overlay_cache.get_overlay(txn, key) {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    /// Local views of `keys`. Keys without any data map to invalid documents.
    pub fn get_documents<'a, I>(
        &self,
        txn: &PersistenceTransaction,
        keys: I,
    ) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let documents = self.remote_document_cache.get_entries(txn, keys);
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys());
        apply_overlays(documents, &overlays)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Applies overlays to `documents`. Documents whose existence changed
    /// remotely get their overlays recomputed, since patch preconditions may
    /// now evaluate differently.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys());
        Ok(self
            .compute_views(txn, documents, &overlays, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents)
    /// but keeps the fields the overlays touched.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys());
        self.compute_views(txn, documents, &overlays, &BTreeSet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        overlays: &BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = BTreeMap::new();
        let mut untouched = BTreeMap::new();
        for (key, document) in documents {
            let overlay = overlays.get(&key);
            let patch_or_missing = overlay
                .map(|overlay| matches!(overlay.mutation, Mutation::Patch { .. }))
                .unwrap_or(true);
            if existence_state_changed.contains(&key) && patch_or_missing {
                recalculate.insert(key, document);
            } else {
                untouched.insert(key, document);
            }
        }

        let mut results = apply_overlays(untouched, overlays);
        if !recalculate.is_empty() {
            let masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
            for (key, document) in recalculate {
                let mutated_fields = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                results.insert(
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                );
            }
        }
        Ok(results)
    }

    /// Replays every pending batch touching `documents` onto them, saves the
    /// resulting overlays and returns the mask of fields each document had
    /// changed (`None` for the whole document).
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, documents.keys());
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();

        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks
                    .remove(&key)
                    .unwrap_or_else(|| Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(document, mask));
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key);
            }
        }

        // Newest batch first; each document's overlay is filed under the
        // latest batch that touched it.
        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(&key), masks.get(&key)) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key, mutation);
                }
            }
            self.document_overlay_cache
                .save_overlays(txn, batch_id, overlays)?;
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys<'a, I>(
        &self,
        txn: &mut PersistenceTransaction,
        keys: I,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let mut documents = self.remote_document_cache.get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Documents matching `query` in the local view, considering only remote
    /// documents read after `offset` and overlays above its batch id.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        mut context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(txn, query);
        }
        if let Some(collection_id) = query.collection_group_id() {
            let mut results = BTreeMap::new();
            for parent in self.index_manager.get_collection_parents(txn, collection_id) {
                let collection_query =
                    query.as_collection_query_at_path(parent.child([collection_id]));
                results.extend(self.get_documents_matching_collection_query(
                    txn,
                    &collection_query,
                    offset,
                    context.as_deref_mut(),
                ));
            }
            return results;
        }
        self.get_documents_matching_collection_query(txn, query, offset, context)
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return BTreeMap::new();
        };
        let document = self.get_document(txn, &key);
        if document.is_found_document() {
            BTreeMap::from([(key, document)])
        } else {
            BTreeMap::new()
        }
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let overlays = self.document_overlay_cache.get_overlays_for_collection(
            txn,
            query.path(),
            offset.largest_batch_id,
        );
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self.remote_document_cache.get_documents_matching_query(
            txn,
            query,
            offset,
            &mutated_keys,
            context,
        );
        // A document may match only because of its overlay.
        for key in overlays.keys() {
            documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay.mutation.apply_to_local_view(
                    &mut document,
                    Some(FieldMask::empty()),
                    Timestamp::now(),
                );
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }

    /// Up to `count` documents of `collection_group` after `offset` in read
    /// time order, plus documents whose overlays changed since the offset's
    /// batch id, with overlays applied.
    pub fn get_next_documents(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> LocalDocumentsBatch {
        let original: BTreeMap<DocumentKey, MutableDocument> = self
            .remote_document_cache
            .get_all_from_collection_group(txn, collection_group, offset, count)
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        let mut overlays = if count > original.len() {
            self.document_overlay_cache.get_overlays_for_collection_group(
                txn,
                collection_group,
                offset.largest_batch_id,
                count - original.len(),
            )
        } else {
            BTreeMap::new()
        };

        let mut batch_id = BATCH_ID_UNKNOWN;
        let mut documents = original.clone();
        for (key, overlay) in &overlays {
            batch_id = batch_id.max(overlay.largest_batch_id);
            if !original.contains_key(key) {
                documents.insert(key.clone(), self.remote_document_cache.get_entry(txn, key));
            }
        }

        // Documents read from the remote cache may carry older overlays.
        let missing: Vec<DocumentKey> = original
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.document_overlay_cache.get_overlays(txn, missing.iter()));

        let changes = apply_overlays(documents, &overlays)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect();
        LocalDocumentsBatch { batch_id, changes }
    }
}

fn apply_overlays(
    documents: BTreeMap<DocumentKey, MutableDocument>,
    overlays: &BTreeMap<DocumentKey, Overlay>,
) -> BTreeMap<DocumentKey, OverlayedDocument> {
    documents
        .into_iter()
        .map(|(key, mut document)| {
            let mutated_fields = match overlays.get(&key) {
                Some(overlay) => overlay.mutation.apply_to_local_view(
                    &mut document,
                    Some(FieldMask::empty()),
                    Timestamp::now(),
                ),
                None => Some(FieldMask::empty()),
            };
            (
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::model::{FieldPath, Precondition, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(
                &FieldPath::from_dot_separated(name).unwrap(),
                FirestoreValue::from_integer(*value),
            );
        }
        data
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
    async fn recalculated_overlay_matches_replay() {
        let persistence = MemoryPersistence::new("client");
        let view = view();
        let remote = MutableDocument::new_found_document(
            key("rooms/a"),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            map(&[("x", 1), ("y", 1)]),
        );
        let (local, overlay) = persistence
            .run_transaction("replay", PersistenceTransactionMode::ReadWrite, |txn| {
                view.remote_document_cache()
                    .add_entry(txn, remote.clone(), remote.version())?;
                view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::new(2, 0),
                    Vec::new(),
                    vec![Mutation::merge(key("rooms/a"), map(&[("x", 2)]))?],
                )?;
                view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::new(3, 0),
                    Vec::new(),
                    vec![Mutation::merge(key("rooms/a"), map(&[("z", 3)]))?],
                )?;
                view.recalculate_and_save_overlays_for_document_keys(txn, [&key("rooms/a")])?;
                let local = view.get_document(txn, &key("rooms/a"));
                let overlay = view.document_overlay_cache().get_overlay(txn, &key("rooms/a"));
                Ok((local, overlay))
            })
            .await
            .unwrap();

        assert_eq!(local.data(), &map(&[("x", 2), ("y", 1), ("z", 3)]));
        assert!(local.has_local_mutations());
        let overlay = overlay.unwrap();
        assert_eq!(overlay.largest_batch_id, 2);
        assert!(matches!(overlay.mutation, Mutation::Patch { .. }));
    }

    fn fields(entries: Vec<(&str, FirestoreValue)>) -> MapValue {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&FieldPath::from_dot_separated(name).unwrap(), value);
        }
        data
    }

    #[test]
    fn folded_overlay_matches_sequential_replay() {
        let found = || {
            MutableDocument::new_found_document(
                key("rooms/a"),
                SnapshotVersion::new(Timestamp::new(1, 0)),
                map(&[("x", 1), ("n", 1), ("meta.count", 1)]),
            )
        };
        let missing = || MutableDocument::new_invalid_document(key("rooms/a"));
        let increment = |n| FirestoreValue::numeric_increment(FirestoreValue::from_integer(n));
        let cases: Vec<(&str, MutableDocument, Vec<Mutation>)> = vec![
            (
                "set after patch",
                found(),
                vec![
                    Mutation::merge(key("rooms/a"), map(&[("x", 2)])).unwrap(),
                    Mutation::set(key("rooms/a"), map(&[("y", 3)])).unwrap(),
                ],
            ),
            (
                "patch after set",
                found(),
                vec![
                    Mutation::set(key("rooms/a"), map(&[("y", 3)])).unwrap(),
                    Mutation::merge(key("rooms/a"), map(&[("x", 2)])).unwrap(),
                ],
            ),
            (
                "delete then merge",
                found(),
                vec![
                    Mutation::delete(key("rooms/a")),
                    Mutation::merge(key("rooms/a"), map(&[("x", 5)])).unwrap(),
                ],
            ),
            (
                "update skipped after delete",
                found(),
                vec![
                    Mutation::delete(key("rooms/a")),
                    Mutation::update(key("rooms/a"), map(&[("x", 5)])).unwrap(),
                ],
            ),
            (
                "verify between merges",
                found(),
                vec![
                    Mutation::merge(key("rooms/a"), map(&[("x", 2)])).unwrap(),
                    Mutation::Verify {
                        key: key("rooms/a"),
                        precondition: Precondition::Exists(true),
                    },
                    Mutation::merge(key("rooms/a"), map(&[("y", 4)])).unwrap(),
                ],
            ),
            (
                "increments across batches",
                found(),
                vec![
                    Mutation::merge(key("rooms/a"), fields(vec![("n", increment(2))])).unwrap(),
                    Mutation::merge(key("rooms/a"), map(&[("x", 7)])).unwrap(),
                    Mutation::merge(key("rooms/a"), fields(vec![("n", increment(3))])).unwrap(),
                ],
            ),
            (
                "server timestamp then merge",
                found(),
                vec![
                    Mutation::merge(
                        key("rooms/a"),
                        fields(vec![("at", FirestoreValue::server_timestamp())]),
                    )
                    .unwrap(),
                    Mutation::merge(key("rooms/a"), map(&[("x", 9)])).unwrap(),
                ],
            ),
            (
                "nested patch then increment",
                found(),
                vec![
                    Mutation::merge(key("rooms/a"), map(&[("meta.count", 4)])).unwrap(),
                    Mutation::merge(key("rooms/a"), fields(vec![("meta.count", increment(1))]))
                        .unwrap(),
                ],
            ),
            (
                "merges on missing document",
                missing(),
                vec![
                    Mutation::merge(key("rooms/a"), map(&[("x", 1)])).unwrap(),
                    Mutation::merge(key("rooms/a"), fields(vec![("n", increment(2))])).unwrap(),
                ],
            ),
            (
                "update skipped on missing document",
                missing(),
                vec![
                    Mutation::update(key("rooms/a"), map(&[("x", 1)])).unwrap(),
                    Mutation::merge(key("rooms/a"), map(&[("y", 2)])).unwrap(),
                ],
            ),
        ];

        for (name, base, mutations) in cases {
            let mut replayed = base.clone();
            let mut mask = Some(FieldMask::empty());
            let mut write_time = Timestamp::new(10, 0);
            for (index, mutation) in mutations.iter().enumerate() {
                write_time = Timestamp::new(10 + index as i64, 0);
                mask = mutation.apply_to_local_view(&mut replayed, mask, write_time);
            }

            let mut folded = base.clone();
            if let Some(overlay) = calculate_overlay_mutation(&replayed, mask.as_ref()) {
                overlay.apply_to_local_view(&mut folded, Some(FieldMask::empty()), write_time);
            }

            assert_eq!(folded.data(), replayed.data(), "{name}");
            assert_eq!(folded.is_found_document(), replayed.is_found_document(), "{name}");
            assert_eq!(folded.is_no_document(), replayed.is_no_document(), "{name}");
            assert_eq!(folded.has_local_mutations(), replayed.has_local_mutations(), "{name}");
        }
    }

    #[tokio::test]
    async fn query_includes_documents_only_present_locally() {
        let persistence = MemoryPersistence::new("client");
        let view = view();
        let query = Query::collection("rooms").unwrap();
        let results = persistence
            .run_transaction("query", PersistenceTransactionMode::ReadWrite, |txn| {
                view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(key("rooms/new"), map(&[("x", 1)]))?],
                )?;
                view.recalculate_and_save_overlays_for_document_keys(txn, [&key("rooms/new")])?;
                Ok(view.get_documents_matching_query(txn, &query, &IndexOffset::none(), None))
            })
            .await
            .unwrap();
        let document = results.get(&key("rooms/new")).unwrap();
        assert!(document.has_local_mutations());
    }

    #[tokio::test]
    async fn deleting_overlay_hides_remote_document() {
        let persistence = MemoryPersistence::new("client");
        let view = view();
        let query = Query::collection("rooms").unwrap();
        let results = persistence
            .run_transaction("delete", PersistenceTransactionMode::ReadWrite, |txn| {
                let remote = MutableDocument::new_found_document(
                    key("rooms/a"),
                    SnapshotVersion::new(Timestamp::new(1, 0)),
                    map(&[("x", 1)]),
                );
                view.remote_document_cache()
                    .add_entry(txn, remote, SnapshotVersion::new(Timestamp::new(1, 0)))?;
                view.mutation_queue().add_mutation_batch(
                    txn,
                    Timestamp::new(2, 0),
                    Vec::new(),
                    vec![Mutation::delete(key("rooms/a"))],
                )?;
                view.recalculate_and_save_overlays_for_document_keys(txn, [&key("rooms/a")])?;
                Ok(view.get_documents_matching_query(txn, &query, &IndexOffset::none(), None))
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
