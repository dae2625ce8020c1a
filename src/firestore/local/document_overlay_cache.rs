use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Net pending change per document for one user. An overlay exists exactly
/// while some pending batch touches the document.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_id: String,
}

impl DocumentOverlayCache {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> Option<Overlay> {
        txn.stores()
            .overlays
            .get(&(self.user_id.clone(), key.clone()))
            .cloned()
    }

    pub fn get_overlays<'a, I>(
        &self,
        txn: &PersistenceTransaction,
        keys: I,
    ) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| {
                self.get_overlay(txn, key)
                    .map(|overlay| (key.clone(), overlay))
            })
            .collect()
    }

    /// Stores `overlays` as computed from batches up to `largest_batch_id`,
    /// replacing earlier overlays of the same documents.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            self.save_overlay(txn, largest_batch_id, key, mutation)?;
        }
        Ok(())
    }

    fn save_overlay(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: BatchId,
        key: DocumentKey,
        mutation: Mutation,
    ) -> FirestoreResult<()> {
        let user_id = self.user_id.clone();
        let stores = txn.stores_mut()?;
        if let Some(existing) = stores.overlays.get(&(user_id.clone(), key.clone())) {
            let previous_batch = existing.largest_batch_id;
            stores
                .overlays_by_batch
                .remove(&(user_id.clone(), previous_batch, key.clone()));
        }
        stores
            .overlays_by_batch
            .insert((user_id.clone(), largest_batch_id, key.clone()));
        stores
            .overlays
            .insert((user_id, key.clone()), Overlay::new(largest_batch_id, mutation));
        txn.record_changed_document(&key);
        Ok(())
    }

    /// Removes the overlays `batch_id` produced for `document_keys`.
    pub fn remove_overlays_for_batch_id<'a, I>(
        &self,
        txn: &mut PersistenceTransaction,
        document_keys: I,
        batch_id: BatchId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let user_id = self.user_id.clone();
        let mut removed = Vec::new();
        {
            let stores = txn.stores_mut()?;
            for key in document_keys {
                let overlay_key = (user_id.clone(), key.clone());
                let matches = stores
                    .overlays
                    .get(&overlay_key)
                    .map(|overlay| overlay.largest_batch_id == batch_id)
                    .unwrap_or(false);
                if matches {
                    stores.overlays.remove(&overlay_key);
                    stores
                        .overlays_by_batch
                        .remove(&(user_id.clone(), batch_id, key.clone()));
                    removed.push(key.clone());
                }
            }
        }
        for key in &removed {
            txn.record_changed_document(key);
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` whose batch id is
    /// above `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        txn.stores()
            .overlays
            .iter()
            .filter(|((user_id, key), overlay)| {
                user_id == &self.user_id
                    && collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays of a collection group above `since_batch_id`, batch by batch,
    /// stopping at the first batch that reaches `count` overlays. Batches are
    /// never split so a caller can resume after the last batch returned.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<BatchId, Vec<(DocumentKey, Overlay)>> = BTreeMap::new();
        for ((user_id, key), overlay) in &txn.stores().overlays {
            if user_id != &self.user_id
                || key.collection_group() != collection_group
                || overlay.largest_batch_id <= since_batch_id
            {
                continue;
            }
            by_batch
                .entry(overlay.largest_batch_id)
                .or_default()
                .push((key.clone(), overlay.clone()));
        }

        let mut result = BTreeMap::new();
        for (_, overlays) in by_batch {
            result.extend(overlays);
            if result.len() >= count {
                break;
            }
        }
        result
    }

    /// Keys whose overlays were computed by `batch_id`.
    pub fn keys_for_batch_id(&self, txn: &PersistenceTransaction, batch_id: BatchId) -> BTreeSet<DocumentKey> {
        txn.stores()
            .overlays_by_batch
            .iter()
            .filter(|(user_id, id, _)| user_id == &self.user_id && *id == batch_id)
            .map(|(_, _, key)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths
            .iter()
            .map(|path| (key(path), Mutation::delete(key(path))))
            .collect()
    }

    #[tokio::test]
    async fn removes_only_overlays_of_matching_batch() {
        let persistence = MemoryPersistence::new("client");
        let cache = DocumentOverlayCache::new("user");
        let (a, b) = persistence
            .run_transaction("overlays", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, overlays(&["c/a", "c/b"]))?;
                cache.save_overlays(txn, 2, overlays(&["c/b"]))?;
                cache.remove_overlays_for_batch_id(txn, [&key("c/a"), &key("c/b")], 1)?;
                Ok((cache.get_overlay(txn, &key("c/a")), cache.get_overlay(txn, &key("c/b"))))
            })
            .await
            .unwrap();
        assert!(a.is_none());
        assert_eq!(b.map(|overlay| overlay.largest_batch_id), Some(2));
    }

    #[tokio::test]
    async fn collection_lookup_filters_by_parent_and_batch() {
        let persistence = MemoryPersistence::new("client");
        let cache = DocumentOverlayCache::new("user");
        let found = persistence
            .run_transaction("collection", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, overlays(&["c/a"]))?;
                cache.save_overlays(txn, 3, overlays(&["c/b", "c/b/sub/x", "d/e"]))?;
                Ok(cache.get_overlays_for_collection(
                    txn,
                    &ResourcePath::from_string("c").unwrap(),
                    1,
                ))
            })
            .await
            .unwrap();
        assert_eq!(found.keys().cloned().collect::<Vec<_>>(), vec![key("c/b")]);
    }

    #[tokio::test]
    async fn collection_group_lookup_keeps_whole_batches() {
        let persistence = MemoryPersistence::new("client");
        let cache = DocumentOverlayCache::new("user");
        let found = persistence
            .run_transaction("group", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, overlays(&["c/a", "x/1/c/b"]))?;
                cache.save_overlays(txn, 2, overlays(&["c/z"]))?;
                Ok(cache.get_overlays_for_collection_group(txn, "c", 0, 1))
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }
}
