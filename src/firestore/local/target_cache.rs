use std::collections::BTreeSet;

use crate::firestore::core::query::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

/// Metadata shared by all targets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetGlobals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    /// Version of the last remote event applied; never moves backwards.
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: usize,
}

/// Cached targets and the documents the backend says match them.
#[derive(Clone, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId> {
        let globals = &mut txn.stores_mut()?.target_globals;
        let mut generator = TargetIdGenerator::for_target_cache(globals.highest_target_id);
        let target_id = generator.next_id();
        globals.highest_target_id = target_id;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction) -> SnapshotVersion {
        txn.stores().target_globals.last_remote_snapshot_version
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction) -> ListenSequenceNumber {
        txn.stores().target_globals.highest_listen_sequence_number
    }

    pub fn set_target_globals(
        &self,
        txn: &mut PersistenceTransaction,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let globals = &mut txn.stores_mut()?.target_globals;
        if highest_listen_sequence_number > globals.highest_listen_sequence_number {
            globals.highest_listen_sequence_number = highest_listen_sequence_number;
        }
        if let Some(version) = last_remote_snapshot_version {
            globals.last_remote_snapshot_version = version;
        }
        Ok(())
    }

    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()> {
        let stores = txn.stores_mut()?;
        if stores.targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Target {} is already cached",
                target_data.target_id
            )));
        }
        let globals = &mut stores.target_globals;
        globals.highest_target_id = globals.highest_target_id.max(target_data.target_id);
        globals.highest_listen_sequence_number = globals
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        globals.target_count += 1;
        stores.targets.insert(target_data.target_id, target_data);
        Ok(())
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: TargetData,
    ) -> FirestoreResult<()> {
        let stores = txn.stores_mut()?;
        if !stores.targets.contains_key(&target_data.target_id) {
            return Err(internal_error(format!(
                "Cannot update unknown target {}",
                target_data.target_id
            )));
        }
        let globals = &mut stores.target_globals;
        globals.highest_listen_sequence_number = globals
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        stores.targets.insert(target_data.target_id, target_data);
        Ok(())
    }

    /// Removes the target together with its matching keys.
    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_id)?;
        let stores = txn.stores_mut()?;
        if stores.targets.remove(&target_id).is_some() {
            stores.target_globals.target_count = stores.target_globals.target_count.saturating_sub(1);
        }
        Ok(())
    }

    /// Cached data for a target equal to `target`, if any.
    pub fn get_target_data(&self, txn: &PersistenceTransaction, target: &Target) -> Option<TargetData> {
        txn.stores()
            .targets
            .values()
            .find(|data| &data.target == target)
            .cloned()
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> Option<TargetData> {
        txn.stores().targets.get(&target_id).cloned()
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction) -> usize {
        txn.stores().target_globals.target_count
    }

    pub fn all_targets(&self, txn: &PersistenceTransaction) -> Vec<TargetData> {
        txn.stores().targets.values().cloned().collect()
    }

    pub fn add_matching_keys<'a, I>(
        &self,
        txn: &mut PersistenceTransaction,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let stores = txn.stores_mut()?;
        for key in keys {
            stores.target_documents.insert((target_id, key.clone()));
            stores.document_targets.insert((key.clone(), target_id));
            stores.orphaned_documents.remove(key);
        }
        Ok(())
    }

    pub fn remove_matching_keys<'a, I>(
        &self,
        txn: &mut PersistenceTransaction,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let sequence_number = txn.current_sequence_number();
        let stores = txn.stores_mut()?;
        for key in keys {
            stores.target_documents.remove(&(target_id, key.clone()));
            stores.document_targets.remove(&(key.clone(), target_id));
            if !has_any_target(&stores.document_targets, key) {
                stores.orphaned_documents.insert(key.clone(), sequence_number);
            }
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let keys: Vec<DocumentKey> = self
            .get_matching_keys_for_target_id(txn, target_id)
            .into_iter()
            .collect();
        self.remove_matching_keys(txn, keys.iter(), target_id)
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> BTreeSet<DocumentKey> {
        txn.stores()
            .target_documents
            .iter()
            .filter(|(id, _)| *id == target_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Whether any cached target references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        has_any_target(&txn.stores().document_targets, key)
    }

    /// Removes targets with a sequence number at or below `upper_bound` that
    /// are not in `active_target_ids`. Returns how many were removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let doomed: Vec<TargetId> = txn
            .stores()
            .targets
            .values()
            .filter(|data| {
                data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id)
            })
            .map(|data| data.target_id)
            .collect();
        for target_id in &doomed {
            self.remove_target_data(txn, *target_id)?;
        }
        Ok(doomed.len())
    }
}

fn has_any_target(document_targets: &BTreeSet<(DocumentKey, TargetId)>, key: &DocumentKey) -> bool {
    document_targets
        .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
        .next()
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::local::target_data::TargetPurpose;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn allocates_even_ids_and_tracks_count() {
        let persistence = MemoryPersistence::new("client");
        let cache = TargetCache::new();
        let (first, second, count) = persistence
            .run_transaction("alloc", PersistenceTransactionMode::ReadWrite, |txn| {
                let first = cache.allocate_target_id(txn)?;
                let sequence_number = txn.current_sequence_number();
                cache.add_target_data(
                    txn,
                    TargetData::new(
                        Query::collection("a").unwrap().to_target(),
                        first,
                        TargetPurpose::Listen,
                        sequence_number,
                    ),
                )?;
                let second = cache.allocate_target_id(txn)?;
                Ok((first, second, cache.get_target_count(txn)))
            })
            .await
            .unwrap();
        assert_eq!((first, second, count), (2, 4, 1));
    }

    #[tokio::test]
    async fn removing_last_reference_orphans_document() {
        let persistence = MemoryPersistence::new("client");
        let cache = TargetCache::new();
        let (contained, orphaned) = persistence
            .run_transaction("keys", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.add_matching_keys(txn, [&key("c/a")], 2)?;
                cache.add_matching_keys(txn, [&key("c/a")], 4)?;
                cache.remove_matching_keys(txn, [&key("c/a")], 2)?;
                let still_contained = cache.contains_key(txn, &key("c/a"));
                cache.remove_matching_keys_for_target_id(txn, 4)?;
                let orphaned = txn.stores().orphaned_documents.contains_key(&key("c/a"));
                Ok((still_contained && !cache.contains_key(txn, &key("c/a")), orphaned))
            })
            .await
            .unwrap();
        assert!(contained);
        assert!(orphaned);
    }

    #[tokio::test]
    async fn remove_targets_spares_active_ones() {
        let persistence = MemoryPersistence::new("client");
        let cache = TargetCache::new();
        let (removed, remaining) = persistence
            .run_transaction("gc", PersistenceTransactionMode::ReadWrite, |txn| {
                for (target_id, sequence_number) in [(2, 1), (4, 2), (6, 10)] {
                    cache.add_target_data(
                        txn,
                        TargetData::new(
                            Query::collection(&format!("c{target_id}")).unwrap().to_target(),
                            target_id,
                            TargetPurpose::Listen,
                            sequence_number,
                        ),
                    )?;
                }
                let removed = cache.remove_targets(txn, 5, &BTreeSet::from([4]))?;
                Ok((removed, cache.get_target_count(txn)))
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(remaining, 2);
    }
}
