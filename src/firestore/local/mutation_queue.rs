use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::error::{internal_error, invalid_argument, FirestoreResult};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};

/// Per user bookkeeping of the mutation queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationQueueMetadata {
    pub next_batch_id: BatchId,
    pub last_acknowledged_batch_id: BatchId,
    /// Token of the last write stream response, sent again on handshake.
    pub last_stream_token: Vec<u8>,
}

impl Default for MutationQueueMetadata {
    fn default() -> Self {
        Self {
            next_batch_id: 1,
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Vec::new(),
        }
    }
}

/// Queue of the batches a user wrote but the backend has not yet
/// acknowledged. Batches are kept in batch id order.
#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    user_id: String,
}

impl MemoryMutationQueue {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &PersistenceTransaction) -> MutationQueueMetadata {
        txn.stores()
            .mutation_queues
            .get(&self.user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn metadata_mut<'a>(
        &self,
        txn: &'a mut PersistenceTransaction,
    ) -> FirestoreResult<&'a mut MutationQueueMetadata> {
        Ok(txn
            .stores_mut()?
            .mutation_queues
            .entry(self.user_id.clone())
            .or_default())
    }

    /// True when the user has no pending batches.
    pub fn check_empty(&self, txn: &PersistenceTransaction) -> bool {
        self.batches(txn).next().is_none()
    }

    fn batches<'a>(&'a self, txn: &'a PersistenceTransaction) -> impl Iterator<Item = &'a MutationBatch> {
        let user_id = self.user_id.clone();
        txn.stores()
            .mutations
            .range((user_id.clone(), BatchId::MIN)..=(user_id, BatchId::MAX))
            .map(|(_, batch)| batch)
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument(
                "mutation batch must contain at least one write",
            ));
        }
        let batch_id = {
            let metadata = self.metadata_mut(txn)?;
            let batch_id = metadata.next_batch_id;
            metadata.next_batch_id += 1;
            batch_id
        };

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let keys = batch.keys();
        {
            let stores = txn.stores_mut()?;
            stores
                .mutations
                .insert((self.user_id.clone(), batch_id), batch.clone());
            for key in &keys {
                stores
                    .document_mutations
                    .insert((self.user_id.clone(), key.clone(), batch_id));
            }
        }
        for key in &keys {
            add_to_collection_parent_index(txn, &key.collection_path())?;
            txn.record_changed_document(key);
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        txn.stores()
            .mutations
            .get(&(self.user_id.clone(), batch_id))
            .cloned()
    }

    /// First batch with an id greater than `batch_id`, used to feed the
    /// write pipeline in order.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        let start = batch_id.saturating_add(1);
        txn.stores()
            .mutations
            .range((self.user_id.clone(), start)..=(self.user_id.clone(), BatchId::MAX))
            .next()
            .map(|(_, batch)| batch.clone())
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction) -> Vec<MutationBatch> {
        self.batches(txn).cloned().collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        self.batch_ids_for_key(txn, key)
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(txn, batch_id))
            .collect()
    }

    /// Batches touching any of `keys`, each once, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys<'a, I>(
        &self,
        txn: &PersistenceTransaction,
        keys: I,
    ) -> Vec<MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let batch_ids: BTreeSet<BatchId> = keys
            .into_iter()
            .flat_map(|key| self.batch_ids_for_key(txn, key))
            .collect();
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(txn, batch_id))
            .collect()
    }

    /// Batches touching documents the query's collection contains.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> Vec<MutationBatch> {
        let batch_ids: BTreeSet<BatchId> = txn
            .stores()
            .document_mutations
            .iter()
            .filter(|(user_id, key, _)| {
                user_id == &self.user_id && query.matches_path_and_collection_group(key)
            })
            .map(|(_, _, batch_id)| *batch_id)
            .collect();
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(txn, batch_id))
            .collect()
    }

    fn batch_ids_for_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> Vec<BatchId> {
        let start = (self.user_id.clone(), key.clone(), BatchId::MIN);
        let end = (self.user_id.clone(), key.clone(), BatchId::MAX);
        txn.stores()
            .document_mutations
            .range(start..=end)
            .map(|(_, _, batch_id)| *batch_id)
            .collect()
    }

    /// Whether any pending batch of any user touches `key`.
    pub fn contains_key(txn: &PersistenceTransaction, key: &DocumentKey) -> bool {
        txn.stores()
            .document_mutations
            .iter()
            .any(|(_, candidate, _)| candidate == key)
    }

    /// Highest batch id not yet acknowledged, or [`BATCH_ID_UNKNOWN`] when
    /// the queue is empty.
    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction) -> BatchId {
        self.batches(txn)
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let user_id = self.user_id.clone();
        let stores = txn.stores_mut()?;
        if stores
            .mutations
            .remove(&(user_id.clone(), batch.batch_id))
            .is_none()
        {
            return Err(internal_error(format!(
                "Cannot remove batch {}: not found in the mutation queue",
                batch.batch_id
            )));
        }
        for mutation in &batch.mutations {
            stores
                .document_mutations
                .remove(&(user_id.clone(), mutation.key().clone(), batch.batch_id));
        }
        for key in batch.keys() {
            txn.record_changed_document(&key);
        }
        Ok(())
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        if self.lookup_mutation_batch(txn, batch.batch_id).is_none() {
            return Err(internal_error(format!(
                "Cannot acknowledge batch {}: not found in the mutation queue",
                batch.batch_id
            )));
        }
        let metadata = self.metadata_mut(txn)?;
        metadata.last_acknowledged_batch_id = metadata.last_acknowledged_batch_id.max(batch.batch_id);
        metadata.last_stream_token = stream_token;
        Ok(())
    }

    pub fn last_stream_token(&self, txn: &PersistenceTransaction) -> Vec<u8> {
        self.metadata(txn).last_stream_token
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        self.metadata_mut(txn)?.last_stream_token = stream_token;
        Ok(())
    }

    /// Verifies the document index is empty whenever the queue is.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction) -> FirestoreResult<()> {
        if !self.check_empty(txn) {
            return Ok(());
        }
        let dangling = txn
            .stores()
            .document_mutations
            .iter()
            .any(|(user_id, _, _)| user_id == &self.user_id);
        if dangling {
            return Err(internal_error(
                "Document leak: mutation index has entries for an empty queue",
            ));
        }
        Ok(())
    }
}
