use std::cmp::Ordering;

use crate::firestore::model::{
    BatchId, DocumentKey, FieldPath, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Index id assigned to indexes that have not been persisted yet.
pub const UNKNOWN_INDEX_ID: i32 = -1;

/// Sequence number of indexes that were never backfilled.
pub const INITIAL_INDEX_SEQUENCE_NUMBER: i64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    Ascending,
    Descending,
    /// One entry per array element, used by `array-contains` filters.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: IndexKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: IndexKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position in the remote document cache up to which an index has been
/// backfilled. Documents sort by read time, then key; an offset without a
/// key sits before every document of its read time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            document_key: None,
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    pub fn new(read_time: SnapshotVersion, document_key: DocumentKey, largest_batch_id: BatchId) -> Self {
        Self {
            read_time,
            document_key: Some(document_key),
            largest_batch_id,
        }
    }

    /// Offset positioned after every document read at or before `read_time`.
    pub fn from_read_time(read_time: SnapshotVersion) -> Self {
        Self::from_read_time_with_batch_id(read_time, BATCH_ID_UNKNOWN)
    }

    pub fn from_read_time_with_batch_id(read_time: SnapshotVersion, largest_batch_id: BatchId) -> Self {
        let timestamp = read_time.timestamp();
        // Timestamp::new carries the extra nanosecond into the seconds.
        let successor = Timestamp::new(timestamp.seconds, timestamp.nanos + 1);
        Self {
            read_time: SnapshotVersion::new(successor),
            document_key: None,
            largest_batch_id,
        }
    }

    /// Offset pointing at the given document.
    pub fn from_document(read_time: SnapshotVersion, key: &DocumentKey) -> Self {
        Self::new(read_time, key.clone(), BATCH_ID_UNKNOWN)
    }

    /// Whether a document read at `read_time` lies after this offset.
    pub fn precedes(&self, read_time: SnapshotVersion, key: &DocumentKey) -> bool {
        self.compare_to_document(read_time, key) == Ordering::Less
    }

    fn compare_to_document(&self, read_time: SnapshotVersion, key: &DocumentKey) -> Ordering {
        self.read_time.cmp(&read_time).then_with(|| match &self.document_key {
            // A key-less offset sits before every key of its read time.
            None => Ordering::Less,
            Some(own) => own.cmp(key),
        })
    }
}

impl PartialOrd for IndexOffset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexOffset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.read_time
            .cmp(&other.read_time)
            .then_with(|| match (&self.document_key, &other.document_key) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(left), Some(right)) => left.cmp(right),
            })
            .then_with(|| self.largest_batch_id.cmp(&other.largest_batch_id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexState {
    pub sequence_number: i64,
    pub offset: IndexOffset,
}

impl IndexState {
    pub fn new(sequence_number: i64, offset: IndexOffset) -> Self {
        Self {
            sequence_number,
            offset,
        }
    }

    pub fn empty() -> Self {
        Self::new(INITIAL_INDEX_SEQUENCE_NUMBER, IndexOffset::none())
    }
}

/// Composite index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub index_state: IndexState,
}

impl FieldIndex {
    pub fn new(collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id: UNKNOWN_INDEX_ID,
            collection_group: collection_group.into(),
            segments,
            index_state: IndexState::empty(),
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == IndexKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != IndexKind::Contains)
    }

    /// Indexes with the same collection group and segments are the same
    /// index, whatever their ids and state.
    pub fn same_definition(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn offsets_order_by_read_time_then_key() {
        let early = IndexOffset::from_document(version(1), &key("c/b"));
        let same_time = IndexOffset::from_document(version(1), &key("c/c"));
        let whole_time = IndexOffset::from_read_time(version(1));
        let later = IndexOffset::from_document(version(2), &key("c/a"));
        assert!(IndexOffset::none() < early);
        assert!(early < same_time);
        assert!(same_time < whole_time);
        assert!(whole_time < later);
    }

    #[test]
    fn precedes_documents_after_offset() {
        let offset = IndexOffset::from_document(version(1), &key("c/b"));
        assert!(offset.precedes(version(1), &key("c/c")));
        assert!(!offset.precedes(version(1), &key("c/b")));
        assert!(!offset.precedes(version(1), &key("c/a")));
        assert!(offset.precedes(version(2), &key("c/a")));

        let read_time_offset = IndexOffset::from_read_time(version(1));
        assert!(!read_time_offset.precedes(version(1), &key("c/z")));
        assert!(read_time_offset.precedes(version(2), &key("c/a")));
    }
}
