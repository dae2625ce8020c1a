use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::DocumentKey;

/// Keeps the bookkeeping the LRU collector needs: when each document was
/// last referenced and which documents are pinned in memory.
#[derive(Clone, Debug, Default)]
pub struct LruReferenceDelegate {
    target_cache: TargetCache,
    remote_document_cache: RemoteDocumentCache,
    in_memory_pins: Arc<Mutex<ReferenceSet>>,
}

impl LruReferenceDelegate {
    pub fn new(in_memory_pins: Arc<Mutex<ReferenceSet>>) -> Self {
        Self {
            target_cache: TargetCache::new(),
            remote_document_cache: RemoteDocumentCache::new(),
            in_memory_pins,
        }
    }

    fn mark_potentially_orphaned(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.current_sequence_number();
        txn.stores_mut()?
            .orphaned_documents
            .insert(key.clone(), sequence_number);
        Ok(())
    }

    pub fn add_reference(
        &self,
        txn: &mut PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    pub fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    pub fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    pub fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_potentially_orphaned(txn, key)
    }

    /// Stamps a released target with the current sequence number so it ages
    /// from now on.
    pub fn remove_target(
        &self,
        txn: &mut PersistenceTransaction,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        let updated = target_data.with_sequence_number(txn.current_sequence_number());
        self.target_cache.update_target_data(txn, updated)
    }

    /// Number of targets and unpinned orphaned documents, each of which
    /// carries one sequence number.
    pub fn get_sequence_number_count(&self, txn: &PersistenceTransaction) -> usize {
        self.target_cache.get_target_count(txn) + self.orphaned_sequence_numbers(txn).len()
    }

    pub fn target_sequence_numbers(&self, txn: &PersistenceTransaction) -> Vec<ListenSequenceNumber> {
        self.target_cache
            .all_targets(txn)
            .iter()
            .map(|target| target.sequence_number)
            .collect()
    }

    /// Sequence numbers of orphaned documents that are not pinned.
    pub fn orphaned_sequence_numbers(&self, txn: &PersistenceTransaction) -> Vec<ListenSequenceNumber> {
        txn.stores()
            .orphaned_documents
            .iter()
            .filter(|(key, sequence_number)| !self.is_pinned(txn, key, **sequence_number))
            .map(|(_, sequence_number)| *sequence_number)
            .collect()
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        self.target_cache
            .remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Removes every cached document that is not pinned at `upper_bound`.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let doomed: Vec<DocumentKey> = self
            .remote_document_cache
            .keys(txn)
            .into_iter()
            .filter(|key| !self.is_pinned(txn, key, upper_bound))
            .collect();
        for key in &doomed {
            self.remote_document_cache.remove_entry(txn, key)?;
            txn.stores_mut()?.orphaned_documents.remove(key);
        }
        Ok(doomed.len())
    }

    /// A document is pinned while a pending mutation, a cached target or a
    /// live view references it, or when it was touched after `upper_bound`.
    pub fn is_pinned(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
        upper_bound: ListenSequenceNumber,
    ) -> bool {
        if self.pins().contains_key(key) {
            return true;
        }
        if MemoryMutationQueue::contains_key(txn, key) {
            return true;
        }
        if self.target_cache.contains_key(txn, key) {
            return true;
        }
        txn.stores()
            .orphaned_documents
            .get(key)
            .map(|orphaned_at| *orphaned_at > upper_bound)
            .unwrap_or(false)
    }

    pub fn get_cache_size(&self, txn: &PersistenceTransaction) -> usize {
        self.remote_document_cache.get_size(txn)
    }

    fn pins(&self) -> std::sync::MutexGuard<'_, ReferenceSet> {
        self.in_memory_pins
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
