use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::model::{DocumentKey, IndexOffset, MutableDocument, SnapshotVersion};

/// Row of the remote document store.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteDocumentEntry {
    pub document: MutableDocument,
    /// Approximate encoded size, used to decide when to collect garbage.
    pub size: usize,
}

fn document_size(document: &MutableDocument) -> usize {
    document.key().path().canonical_string().len() + document.data().approximate_size()
}

/// Last known server state of every cached document.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Stores `document` as read at `read_time`. Only versions coming from
    /// the backend belong here, never local views.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction,
        mut document: MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        if read_time.is_min() && !document.is_no_document() && !document.is_unknown_document() {
            return Err(invalid_argument(format!(
                "Cannot add document {} to the cache with a read time of zero",
                document.key()
            )));
        }
        let key = document.key().clone();
        let collection_path = key.collection_path();
        document.set_read_time(read_time);
        let size = document_size(&document);
        let stores = txn.stores_mut()?;
        stores
            .remote_documents
            .insert(key.clone(), RemoteDocumentEntry { document, size });
        add_to_collection_parent_index(txn, &collection_path)?;
        txn.record_changed_document(&key);
        Ok(())
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        txn.stores_mut()?.remote_documents.remove(key);
        txn.record_changed_document(key);
        Ok(())
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> MutableDocument {
        txn.stores()
            .remote_documents
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'a, I>(
        &self,
        txn: &PersistenceTransaction,
        keys: I,
    ) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    /// Documents of the query's collection read after `offset` that match
    /// the query, plus every document in `mutated_keys` regardless of match
    /// since pending writes may still make them match.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
        mut context: Option<&mut QueryContext>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let collection_path = query.path();
        let mut results = BTreeMap::new();
        for (key, entry) in &txn.stores().remote_documents {
            if !collection_path.is_immediate_parent_of(key.path()) {
                continue;
            }
            if let Some(context) = context.as_deref_mut() {
                context.increment_documents_read_count(1);
            }
            let document = &entry.document;
            let mutated = mutated_keys.contains(key);
            if !offset.precedes(document.read_time(), key) && !mutated {
                continue;
            }
            if !mutated && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    /// Documents of a collection group read after `offset`, ordered by read
    /// time then key, at most `limit` of them.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> Vec<MutableDocument> {
        let mut documents: Vec<&MutableDocument> = txn
            .stores()
            .remote_documents
            .iter()
            .filter(|(key, entry)| {
                key.collection_group() == collection_group
                    && offset.precedes(entry.document.read_time(), key)
            })
            .map(|(_, entry)| &entry.document)
            .collect();
        documents.sort_by(|left, right| {
            left.read_time()
                .cmp(&right.read_time())
                .then_with(|| left.key().cmp(right.key()))
        });
        documents.into_iter().take(limit).cloned().collect()
    }

    /// Total approximate size of the cached documents.
    pub fn get_size(&self, txn: &PersistenceTransaction) -> usize {
        txn.stores()
            .remote_documents
            .values()
            .map(|entry| entry.size)
            .sum()
    }

    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        txn.stores().remote_documents.contains_key(key)
    }

    pub fn keys(&self, txn: &PersistenceTransaction) -> Vec<DocumentKey> {
        txn.stores().remote_documents.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, value: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("value").unwrap(),
            FirestoreValue::from_integer(value),
        );
        MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), version(1), data)
    }

    #[tokio::test]
    async fn query_scan_respects_offset_and_collection() {
        let persistence = MemoryPersistence::new("client");
        let cache = RemoteDocumentCache::new();
        persistence
            .run_transaction("seed", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, doc("rooms/a", 1), version(1))?;
                cache.add_entry(txn, doc("rooms/b", 2), version(2))?;
                cache.add_entry(txn, doc("rooms/a/messages/m", 3), version(3))?;
                cache.add_entry(txn, doc("other/c", 4), version(3))
            })
            .await
            .unwrap();

        let query = Query::collection("rooms").unwrap();
        let (all, since_one, read) = persistence
            .run_transaction("read", PersistenceTransactionMode::ReadOnly, |txn| {
                let mut context = QueryContext::default();
                let all = cache.get_documents_matching_query(
                    txn,
                    &query,
                    &IndexOffset::none(),
                    &BTreeSet::new(),
                    Some(&mut context),
                );
                let since_one = cache.get_documents_matching_query(
                    txn,
                    &query,
                    &IndexOffset::from_read_time(version(1)),
                    &BTreeSet::new(),
                    None,
                );
                Ok((all, since_one, context.documents_read_count()))
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(read, 2);
        assert_eq!(since_one.len(), 1);
        assert!(since_one.contains_key(&DocumentKey::from_string("rooms/b").unwrap()));
    }

    #[tokio::test]
    async fn tracks_size_and_removal() {
        let persistence = MemoryPersistence::new("client");
        let cache = RemoteDocumentCache::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let (before, after) = persistence
            .run_transaction("size", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, doc("rooms/a", 1), version(1))?;
                let before = cache.get_size(txn);
                cache.remove_entry(txn, &key)?;
                Ok((before, cache.get_size(txn)))
            })
            .await
            .unwrap();
        assert!(before > 0);
        assert_eq!(after, 0);
    }

    #[tokio::test]
    async fn collection_group_scan_orders_by_read_time() {
        let persistence = MemoryPersistence::new("client");
        let cache = RemoteDocumentCache::new();
        let docs = persistence
            .run_transaction("group", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, doc("a/1/messages/x", 1), version(3))?;
                cache.add_entry(txn, doc("b/2/messages/y", 1), version(2))?;
                cache.add_entry(txn, doc("messages/z", 1), version(4))?;
                Ok(cache.get_all_from_collection_group(txn, "messages", &IndexOffset::none(), 2))
            })
            .await
            .unwrap();
        let ids: Vec<&str> = docs.iter().map(|doc| doc.key().id()).collect();
        assert_eq!(ids, vec!["y", "x"]);
    }
}
