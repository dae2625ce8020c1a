use crate::firestore::core::query::Target;
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A regular user listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom
    /// filter.
    ExistenceFilterMismatch,
    /// Re-listen after the bloom filter failed to reconcile the count.
    ExistenceFilterMismatchBloom,
    /// Single-document target resolving a limbo document.
    LimboResolution,
}

/// Local bookkeeping for one target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest version the backend reported the target consistent at.
    pub snapshot_version: SnapshotVersion,
    /// Latest version at which the target's results had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque token for resuming the target on the watch stream. Empty when
    /// the target has never been acknowledged.
    pub resume_token: Vec<u8>,
    /// Document count expected by the backend when resuming, used to detect
    /// deletes missed while offline.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume token and snapshot version. The expected count only
    /// applies to the token it was sent with, so it is cleared.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
