use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::firestore::core::types::TargetId;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, WatchChange,
    WatchTargetChange, WatchTargetChangeState,
};

const LOG_TAG: &str = "WatchChangeAggregator";

/// Read access to the targets the client is listening to.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` once the target is no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Outcome of applying a bloom filter after an existence filter mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Watch requests (adds and removes) not yet acknowledged. Changes for a
    /// target with outstanding requests are dropped.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A freshly created target always produces a first change so
            // that the view can raise its initial snapshot.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between two consistent snapshots and turns them
/// into a [`RemoteEvent`].
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    /// Targets each changed document currently belongs to, used to find
    /// documents only referenced by limbo resolutions.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_watch_change(&mut self, metadata: &dyn TargetMetadataProvider, change: WatchChange) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(metadata, change),
            WatchChange::DocumentChange(change) => self.handle_document_change(metadata, change),
            WatchChange::DocumentDelete(change) => self.handle_document_delete(metadata, change),
            WatchChange::DocumentRemove(change) => self.handle_document_remove(metadata, change),
            WatchChange::ExistenceFilter(change) => self.handle_existence_filter(metadata, change),
        }
    }

    /// Counts a watch request sent for `target_id`; its response must arrive
    /// before further changes for the target are trusted.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn handle_document_change(&mut self, metadata: &dyn TargetMetadataProvider, change: DocumentChange) {
        let DocumentChange {
            updated_target_ids,
            removed_target_ids,
            document,
        } = change;
        let key = document.key().clone();
        for target_id in updated_target_ids {
            if document.is_found_document() {
                self.add_document_to_target(metadata, target_id, document.clone());
            } else {
                self.remove_document_from_target(metadata, target_id, &key, Some(document.clone()));
            }
        }
        for target_id in removed_target_ids {
            self.remove_document_from_target(metadata, target_id, &key, Some(document.clone()));
        }
    }

    fn handle_document_delete(&mut self, metadata: &dyn TargetMetadataProvider, change: DocumentDelete) {
        let document = MutableDocument::new_no_document(change.key.clone(), change.read_time);
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(metadata, target_id, &change.key, Some(document.clone()));
        }
    }

    fn handle_document_remove(&mut self, metadata: &dyn TargetMetadataProvider, change: DocumentRemove) {
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(metadata, target_id, &change.key, None);
        }
    }

    fn handle_target_change(&mut self, metadata: &dyn TargetMetadataProvider, change: WatchTargetChange) {
        for target_id in self.targets_for_change(metadata, &change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(metadata, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A target re-added after a remove starts over.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    if change.cause.is_some() {
                        warn!("[{LOG_TAG}] Target {target_id} removed with a cause that was not handled upstream");
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(metadata, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(metadata, target_id) {
                        // Drop everything known about the target; the backend
                        // resends its full result set.
                        self.reset_target(metadata, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Target ids a target change applies to. An empty id list addresses
    /// every active target.
    fn targets_for_change(
        &self,
        metadata: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(metadata, *target_id))
            .collect()
    }

    fn handle_existence_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: ExistenceFilterChange,
    ) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document is gone. A NoDocument at version zero lets the
                // cache drop it without claiming a newer version.
                let key = match DocumentKey::from_path(target_data.target.path.clone()) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!("[{LOG_TAG}] Document target {target_id} has an invalid path: {err}");
                        return;
                    }
                };
                let document = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(metadata, target_id, &key, Some(document));
            } else if expected_count != 1 {
                warn!(
                    "[{LOG_TAG}] Single document existence filter for target {target_id} has count {expected_count}"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(metadata, target_id);
        if current_count == expected_count as usize {
            return;
        }

        let application = self.apply_bloom_filter(metadata, &change, current_count);
        debug!(
            "[{LOG_TAG}] Existence filter mismatch for target {target_id}: expected {expected_count}, \
             local {current_count}, bloom filter {application:?}"
        );
        if application == BloomFilterApplication::Success {
            return;
        }

        // Re-listen from scratch; the purpose tells the backend why.
        self.reset_target(metadata, target_id);
        let purpose = if application == BloomFilterApplication::FalsePositive {
            TargetPurpose::ExistenceFilterMismatchBloom
        } else {
            TargetPurpose::ExistenceFilterMismatch
        };
        self.pending_target_resets.insert(target_id, purpose);
    }

    fn apply_bloom_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplication {
        let Some(payload) = change.unchanged_names.as_ref() else {
            return BloomFilterApplication::Skipped;
        };
        let filter = match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
            Ok(filter) => filter,
            Err(err) => {
                warn!("[{LOG_TAG}] Ignoring malformed bloom filter: {err}");
                return BloomFilterApplication::Skipped;
            }
        };
        if filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(metadata, &filter, change.target_id);
        if current_count.saturating_sub(removed) == change.count.max(0) as usize {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached document of the target that is definitely absent
    /// from the bloom filter. Returns how many were removed.
    fn filter_removed_documents(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        filter: &BloomFilter,
        target_id: TargetId,
    ) -> usize {
        let existing_keys = metadata.get_remote_keys_for_target(target_id);
        let mut removed = 0;
        for key in existing_keys {
            if !filter.might_contain(&self.serializer.document_name(&key)) {
                self.remove_document_from_target(metadata, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything aggregated since the last call and
    /// resets the pending document state.
    pub fn create_remote_event(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);

            if current && target_data.target.is_document_target() {
                // A document target that is current without ever having seen
                // its document proves the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let seen_in_event = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map(|targets| targets.contains(&target_id))
                        .unwrap_or(false);
                    if !seen_in_event && !self.target_contains_document(metadata, target_id, &key) {
                        let document = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(metadata, target_id, &key, Some(document));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(metadata, *target_id)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: MutableDocument,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(metadata, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes the document from the target. `updated_document`, when known,
    /// replaces the cached copy.
    fn remove_document_from_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let existed = self.target_contains_document(metadata, target_id, key);
        let state = self.ensure_target_state(target_id);
        if existed {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within the same event.
            state.remove_document_change(key);
        }

        // The mapping holds every target that touched the key in this event,
        // removals included, so only limbo-only keys count as resolved.
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);

        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) {
        if self
            .target_states
            .get(&target_id)
            .map(TargetState::is_pending)
            .unwrap_or(false)
        {
            warn!("[{LOG_TAG}] Resetting target {target_id} with pending responses");
        }
        self.target_states.insert(target_id, TargetState::default());

        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(metadata, target_id, &key, None);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = metadata.get_remote_keys_for_target(target_id).len();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn target_contains_document(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }

    fn is_active_target(&self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(metadata, target_id)
            .is_some()
    }

    /// Target data for a target that is listened to and has no outstanding
    /// watch requests.
    fn target_data_for_active_target(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Query, Target};
    use crate::firestore::model::{DatabaseId, Timestamp};
    use crate::firestore::remote::watch_change::BloomFilterPayload;
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_target(mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self
        }

        fn with_remote_keys(mut self, target_id: TargetId, paths: &[&str]) -> Self {
            self.remote_keys
                .insert(target_id, paths.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(1), MapValue::default())
    }

    fn rooms() -> Target {
        Query::collection("rooms").unwrap().to_target()
    }

    fn target_change(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange {
            state,
            target_ids,
            resume_token: b"resume".to_vec(),
            cause: None,
        })
    }

    fn document_change(path: &str, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
            document: doc(path),
        })
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_remote_keys(1, &["rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(1);

        aggregator.handle_watch_change(&metadata, target_change(WatchTargetChangeState::Added, vec![1]));
        aggregator.handle_watch_change(&metadata, document_change("rooms/a", vec![1]));
        aggregator.handle_watch_change(&metadata, document_change("rooms/b", vec![1]));
        aggregator.handle_watch_change(&metadata, target_change(WatchTargetChangeState::Current, vec![1]));

        let event = aggregator.create_remote_event(&metadata, version(5));
        assert_eq!(event.snapshot_version, version(5));
        let change = &event.target_changes[&1];
        assert!(change.current);
        assert_eq!(change.resume_token, b"resume".to_vec());
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(change.modified_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(5));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn removal_from_query_target_does_not_resolve_limbo() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_remote_keys(1, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_watch_change(
            &metadata,
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![1],
                document: doc("rooms/a"),
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_changes[&1].removed_documents.contains(&key("rooms/a")));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn removal_from_limbo_target_resolves_limbo() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_target(3, Target::for_document(&key("rooms/a")), TargetPurpose::LimboResolution)
            .with_remote_keys(3, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_watch_change(
            &metadata,
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![3],
                document: doc("rooms/a"),
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn ignores_changes_while_target_request_is_pending() {
        let metadata = TestMetadata::default().with_target(1, rooms(), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(1);

        aggregator.handle_watch_change(&metadata, document_change("rooms/a", vec![1]));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_filter_resets_target() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_remote_keys(1, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: None,
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(3));
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let change = &event.target_changes[&1];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    fn bloom_payload(members: &[&str]) -> BloomFilterPayload {
        let serializer = serializer();
        let mut filter = BloomFilter::new(vec![0; 64], 0, 7).unwrap();
        for path in members {
            filter.insert(&serializer.document_name(&key(path)));
        }
        BloomFilterPayload {
            bitmap: filter.bitmap().to_vec(),
            padding: 0,
            hash_count: 7,
        }
    }

    #[test]
    fn bloom_filter_removes_deleted_documents_without_reset() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_remote_keys(1, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 2,
                unchanged_names: Some(bloom_payload(&["rooms/a", "rooms/c"])),
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(4));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&1];
        assert_eq!(
            change.removed_documents,
            BTreeSet::from([key("rooms/b")])
        );
    }

    #[test]
    fn bloom_filter_false_positive_requests_bloom_mismatch_purpose() {
        let metadata = TestMetadata::default()
            .with_target(1, rooms(), TargetPurpose::Listen)
            .with_remote_keys(1, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        // All three names are present, yet the backend only has one match.
        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 1,
                count: 1,
                unchanged_names: Some(bloom_payload(&["rooms/a", "rooms/b", "rooms/c"])),
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(4));
        assert_eq!(
            event.target_mismatches.get(&1),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn empty_document_target_synthesizes_delete_and_resolves_limbo() {
        let document_target = Target::for_document(&key("rooms/missing"));
        let metadata =
            TestMetadata::default().with_target(2, document_target, TargetPurpose::LimboResolution);
        let mut aggregator = WatchChangeAggregator::new(serializer());
        aggregator.record_pending_target_request(2);

        aggregator.handle_watch_change(&metadata, target_change(WatchTargetChangeState::Added, vec![2]));
        aggregator.handle_watch_change(&metadata, target_change(WatchTargetChangeState::Current, vec![2]));

        let event = aggregator.create_remote_event(&metadata, version(6));
        let document = &event.document_updates[&key("rooms/missing")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/missing")));
    }

    #[test]
    fn document_target_existence_filter_of_zero_deletes_document() {
        let document_target = Target::for_document(&key("rooms/a"));
        let metadata = TestMetadata::default()
            .with_target(3, document_target, TargetPurpose::Listen)
            .with_remote_keys(3, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new(serializer());

        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 3,
                count: 0,
                unchanged_names: None,
            }),
        );

        let event = aggregator.create_remote_event(&metadata, version(7));
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert!(event.target_changes[&3].removed_documents.contains(&key("rooms/a")));
        assert!(event.target_mismatches.is_empty());
    }
}
