use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Batch id used before any batch has been written.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations committed together by one user write.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Patches recording the values non-idempotent transforms were computed
    /// against. Applied locally only, never sent.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

/// Local view of a document plus the fields pending writes touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    /// `None` when the whole document was replaced.
    pub mutated_fields: Option<FieldMask>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the server results for this batch to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            if let Some(result) = batch_result.mutation_results.get(index) {
                mutation.apply_to_remote_document(document, result);
            }
        }
    }

    /// Applies this batch's writes for `document` to its local view.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.base_mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        for mutation in &self.mutations {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and returns the new
    /// overlay for each one that still has pending changes.
    ///
    /// Keys in `documents_without_remote_version` get full-document overlays.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mutated = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.take(),
            );
            let mutated = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mutated
            };
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Server acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document has after the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    #[test]
    fn result_requires_one_result_per_mutation() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(key("c/a"))],
        );
        let err = MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn local_document_set_produces_overlays_per_key() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("c/a"), data("x", 1)).unwrap(),
                Mutation::merge(key("c/b"), data("y", 2)).unwrap(),
            ],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("c/a"),
            OverlayedDocument {
                document: MutableDocument::new_invalid_document(key("c/a")),
                mutated_fields: Some(FieldMask::empty()),
            },
        );
        documents.insert(
            key("c/b"),
            OverlayedDocument {
                document: MutableDocument::new_found_document(
                    key("c/b"),
                    SnapshotVersion::new(Timestamp::new(1, 0)),
                    data("z", 0),
                ),
                mutated_fields: Some(FieldMask::empty()),
            },
        );

        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        assert!(matches!(overlays.get(&key("c/a")), Some(Mutation::Set { .. })));
        assert!(matches!(overlays.get(&key("c/b")), Some(Mutation::Patch { .. })));
        assert_eq!(
            documents[&key("c/b")].document.data().fields().len(),
            2,
            "patch keeps existing fields"
        );
    }
}
