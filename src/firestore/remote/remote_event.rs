use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::types::TargetId;
use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Aggregated result of a batch of watch changes, applied to the local store
/// in one step.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    /// Consistent version of everything in the event.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; they must be re-listened
    /// without a resume token.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Limbo documents this event settled.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }

    /// Event produced when a target becomes current without a snapshot from
    /// the backend, e.g. for a document target resolved by an empty result.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::create_synthesized_target_change_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }
}

/// What happened to one target within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Opaque token to resume the target from this point; empty when the
    /// backend sent none.
    pub resume_token: Vec<u8>,
    /// Whether the target's results are consistent with the snapshot version.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn create_synthesized_target_change_for_current_change(
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
