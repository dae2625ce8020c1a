use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::firestore::core::query::{
    document_field_value, FieldFilter, FilterOperator, OrderBy, OrderDirection, Target,
};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment, IndexState,
    MutableDocument, ResourcePath, SnapshotVersion,
};
use crate::firestore::value::{compare_values, FirestoreValue, MapValue};

const LOG_TAG: &str = "IndexManager";

/// How much of a target an index can answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No index serves the target; a collection scan is needed.
    None,
    /// An index narrows the candidates, which still need filtering.
    Partial,
    /// An index covers every filter and ordering of the target.
    Full,
}

/// Value inside an index entry, ordered by the value order and reversed
/// for descending segments.
#[derive(Clone, Debug)]
pub struct IndexValue {
    value: FirestoreValue,
    descending: bool,
}

impl IndexValue {
    fn new(value: FirestoreValue, descending: bool) -> Self {
        Self { value, descending }
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let ordering = compare_values(&self.value, &other.value);
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// One row of an index: the document's values for the index segments.
/// Rows sort the way the index orders documents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub index_id: i32,
    pub user_id: String,
    pub array_value: Option<IndexValue>,
    pub directional_values: Vec<IndexValue>,
    pub document_key: DocumentKey,
}

/// Records that documents exist below `collection_path`, so collection
/// group queries know which parents to visit.
pub fn add_to_collection_parent_index(
    txn: &mut PersistenceTransaction,
    collection_path: &ResourcePath,
) -> FirestoreResult<()> {
    let Some(collection_id) = collection_path.last_segment() else {
        return Ok(());
    };
    let parent = collection_path.without_last();
    let collection_id = collection_id.to_string();
    let known = txn
        .stores()
        .collection_parents
        .get(&collection_id)
        .map(|parents| parents.contains(&parent))
        .unwrap_or(false);
    if !known {
        txn.stores_mut()?
            .collection_parents
            .entry(collection_id)
            .or_default()
            .insert(parent);
    }
    Ok(())
}

/// Client-side field indexes of one user.
#[derive(Clone, Debug)]
pub struct MemoryIndexManager {
    user_id: String,
}

impl MemoryIndexManager {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> Vec<ResourcePath> {
        txn.stores()
            .collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores a new index definition. Its entries are filled in by the
    /// backfiller. Returns the assigned index id.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction,
        index: FieldIndex,
    ) -> FirestoreResult<i32> {
        if let Some(existing) = txn
            .stores()
            .index_configuration
            .values()
            .find(|candidate| candidate.same_definition(&index))
        {
            return Ok(existing.index_id);
        }
        let index_id = txn
            .stores()
            .index_configuration
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1);
        debug!(
            "[{LOG_TAG}] Adding index {index_id} on collection group {}",
            index.collection_group
        );
        let stores = txn.stores_mut()?;
        stores.index_configuration.insert(
            index_id,
            FieldIndex {
                index_id,
                index_state: IndexState::empty(),
                ..index
            },
        );
        stores
            .index_state
            .insert((index_id, self.user_id.clone()), IndexState::empty());
        Ok(index_id)
    }

    pub fn delete_field_index(
        &self,
        txn: &mut PersistenceTransaction,
        index: &FieldIndex,
    ) -> FirestoreResult<()> {
        let stores = txn.stores_mut()?;
        stores.index_configuration.remove(&index.index_id);
        stores
            .index_state
            .retain(|(index_id, _), _| *index_id != index.index_id);
        stores
            .index_entries
            .retain(|entry| entry.index_id != index.index_id);
        Ok(())
    }

    /// Indexes of `collection_group` (or of all groups) with this user's
    /// backfill state.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction,
        collection_group: Option<&str>,
    ) -> Vec<FieldIndex> {
        txn.stores()
            .index_configuration
            .values()
            .filter(|index| {
                collection_group
                    .map(|group| index.collection_group == group)
                    .unwrap_or(true)
            })
            .map(|index| {
                let index_state = txn
                    .stores()
                    .index_state
                    .get(&(index.index_id, self.user_id.clone()))
                    .cloned()
                    .unwrap_or_else(IndexState::empty);
                FieldIndex {
                    index_state,
                    ..index.clone()
                }
            })
            .collect()
    }

    /// The serving index with the most segments.
    fn get_field_index(&self, txn: &PersistenceTransaction, target: &Target) -> Option<FieldIndex> {
        let collection_group = target.collection_group_id()?;
        let matcher = TargetIndexMatcher::new(target);
        self.get_field_indexes(txn, Some(collection_group))
            .into_iter()
            .filter(|index| matcher.served_by_index(index))
            .max_by_key(|index| index.segments.len())
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction, target: &Target) -> IndexType {
        match self.get_field_index(txn, target) {
            None => IndexType::None,
            Some(index) if index.segments.len() < target_segment_count(target) => {
                IndexType::Partial
            }
            Some(_) => IndexType::Full,
        }
    }

    /// Keys of documents whose index entries satisfy the target's indexed
    /// constraints, in index order. `None` when no index serves the target.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> Option<Vec<DocumentKey>> {
        let index = self.get_field_index(txn, target)?;
        let filters_by_segment: Vec<(&IndexSegment, Vec<&FieldFilter>)> = index
            .array_segment()
            .into_iter()
            .chain(index.directional_segments())
            .map(|segment| {
                let filters = target
                    .filters
                    .iter()
                    .filter(|filter| filter.field() == &segment.field_path)
                    .collect();
                (segment, filters)
            })
            .collect();

        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for entry in &txn.stores().index_entries {
            if entry.index_id != index.index_id || entry.user_id != self.user_id {
                continue;
            }
            if !entry_satisfies_filters(entry, &filters_by_segment) {
                continue;
            }
            if seen.insert(entry.document_key.clone()) {
                keys.push(entry.document_key.clone());
            }
        }
        debug!(
            "[{LOG_TAG}] Index {} returned {} candidates for {target}",
            index.index_id,
            keys.len()
        );
        Some(keys)
    }

    /// Rewrites the entries of every index of each document's collection
    /// group.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction,
        documents: &BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<()> {
        for (key, document) in documents {
            let indexes = self.get_field_indexes(txn, Some(key.collection_group()));
            for index in indexes {
                let new_entries = self.compute_index_entries(&index, document);
                let stores = txn.stores_mut()?;
                stores.index_entries.retain(|entry| {
                    !(entry.index_id == index.index_id
                        && entry.user_id == self.user_id
                        && &entry.document_key == key)
                });
                stores.index_entries.extend(new_entries);
            }
        }
        Ok(())
    }

    fn compute_index_entries(&self, index: &FieldIndex, document: &MutableDocument) -> Vec<IndexEntry> {
        if !document.is_found_document() {
            return Vec::new();
        }
        let mut directional_values = Vec::new();
        for segment in index.directional_segments() {
            let Some(value) = document_field_value(document, &segment.field_path) else {
                return Vec::new();
            };
            directional_values.push(IndexValue::new(
                value,
                segment.kind == IndexKind::Descending,
            ));
        }

        let entry = |array_value: Option<IndexValue>| IndexEntry {
            index_id: index.index_id,
            user_id: self.user_id.clone(),
            array_value,
            directional_values: directional_values.clone(),
            document_key: document.key().clone(),
        };

        match index.array_segment() {
            None => vec![entry(None)],
            Some(segment) => {
                let Some(array) = document
                    .field(&segment.field_path)
                    .and_then(FirestoreValue::as_array)
                else {
                    return Vec::new();
                };
                let elements: BTreeSet<IndexValue> = array
                    .values()
                    .iter()
                    .map(|value| IndexValue::new(value.clone(), false))
                    .collect();
                elements.into_iter().map(|value| entry(Some(value))).collect()
            }
        }
    }

    /// Marks every index of `collection_group` as backfilled up to `offset`
    /// and moves the group to the back of the update order.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction,
        collection_group: &str,
        offset: IndexOffset,
    ) -> FirestoreResult<()> {
        let next_sequence_number = txn
            .stores()
            .index_state
            .values()
            .map(|state| state.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        let index_ids: Vec<i32> = self
            .get_field_indexes(txn, Some(collection_group))
            .iter()
            .map(|index| index.index_id)
            .collect();
        let stores = txn.stores_mut()?;
        for index_id in index_ids {
            stores.index_state.insert(
                (index_id, self.user_id.clone()),
                IndexState::new(next_sequence_number, offset.clone()),
            );
        }
        Ok(())
    }

    /// Smallest backfill offset among the indexes of `collection_group`.
    pub fn get_min_offset_from_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
    ) -> IndexOffset {
        self.get_field_indexes(txn, Some(collection_group))
            .into_iter()
            .map(|index| index.index_state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none)
    }

    /// Backfill offset of the index serving `target`.
    pub fn get_min_offset(&self, txn: &PersistenceTransaction, target: &Target) -> IndexOffset {
        self.get_field_index(txn, target)
            .map(|index| index.index_state.offset)
            .unwrap_or_else(IndexOffset::none)
    }

    /// Group whose indexes were updated least recently.
    pub fn get_next_collection_group_to_update(
        &self,
        txn: &PersistenceTransaction,
    ) -> Option<String> {
        self.get_field_indexes(txn, None)
            .into_iter()
            .min_by(|left, right| {
                left.index_state
                    .sequence_number
                    .cmp(&right.index_state.sequence_number)
                    .then_with(|| left.collection_group.cmp(&right.collection_group))
            })
            .map(|index| index.collection_group)
    }

    /// Creates an index that fully serves `target`, unless one exists.
    pub fn create_target_indexes(
        &self,
        txn: &mut PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<()> {
        if self.get_index_type(txn, target) == IndexType::Full {
            return Ok(());
        }
        let matcher = TargetIndexMatcher::new(target);
        if let Some(index) = matcher.build_target_index() {
            self.add_field_index(txn, index)?;
        }
        Ok(())
    }
}

fn entry_satisfies_filters(
    entry: &IndexEntry,
    filters_by_segment: &[(&IndexSegment, Vec<&FieldFilter>)],
) -> bool {
    let mut directional = entry.directional_values.iter();
    for (segment, filters) in filters_by_segment {
        let value = if segment.kind == IndexKind::Contains {
            entry.array_value.as_ref()
        } else {
            directional.next()
        };
        let Some(value) = value else {
            return false;
        };
        if !filters
            .iter()
            .all(|filter| index_value_matches(segment.kind, filter, value.value()))
        {
            return false;
        }
    }
    true
}

// Array entries hold one element each, so array filters compare the element
// directly. Other filters on array segments are left to the caller.
fn index_value_matches(kind: IndexKind, filter: &FieldFilter, value: &FirestoreValue) -> bool {
    let is_array_filter = matches!(
        filter.operator(),
        FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
    );
    match (kind, filter.operator()) {
        (IndexKind::Contains, FilterOperator::ArrayContains) => {
            compare_values(value, filter.value()) == Ordering::Equal
        }
        (IndexKind::Contains, FilterOperator::ArrayContainsAny) => filter
            .value()
            .as_array()
            .map(|needles| needles.contains(value))
            .unwrap_or(false),
        (IndexKind::Contains, _) => true,
        _ if is_array_filter || filter.field().is_key_field() => true,
        _ => probe_document(filter.field(), value)
            .map(|document| filter.matches(&document))
            .unwrap_or(true),
    }
}

// Wraps a single indexed value in a document so index scans and in-memory
// matching share one definition of filter semantics.
fn probe_document(field: &FieldPath, value: &FirestoreValue) -> Option<MutableDocument> {
    let key = DocumentKey::from_path(ResourcePath::from_segments(["__index__", "probe"])).ok()?;
    let mut data = MapValue::empty();
    data.set(field, value.clone());
    Some(MutableDocument::new_found_document(
        key,
        SnapshotVersion::min(),
        data,
    ))
}

/// Number of index segments needed to fully serve `target`.
fn target_segment_count(target: &Target) -> usize {
    let mut fields = BTreeSet::new();
    let mut has_array_segment = false;
    for filter in &target.filters {
        if filter.field().is_key_field() {
            continue;
        }
        match filter.operator() {
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => {
                has_array_segment = true
            }
            _ => {
                fields.insert(filter.field().clone());
            }
        }
    }
    for order in &target.order_by {
        if !order.field().is_key_field() {
            fields.insert(order.field().clone());
        }
    }
    fields.len() + usize::from(has_array_segment)
}

/// Decides whether an index can serve a target and builds the index that
/// would serve it best.
struct TargetIndexMatcher<'a> {
    target: &'a Target,
    equality_filters: Vec<&'a FieldFilter>,
    inequality_fields: Vec<&'a FieldPath>,
}

impl<'a> TargetIndexMatcher<'a> {
    fn new(target: &'a Target) -> Self {
        let equality_filters = target
            .filters
            .iter()
            .filter(|filter| !filter.operator().is_inequality())
            .collect();
        Self {
            target,
            equality_filters,
            inequality_fields: target.inequality_fields(),
        }
    }

    fn has_matching_equality_filter(&self, segment: &IndexSegment) -> bool {
        self.equality_filters
            .iter()
            .any(|filter| matches_filter(filter, segment))
    }

    fn served_by_index(&self, index: &FieldIndex) -> bool {
        if self.inequality_fields.len() > 1 {
            return false;
        }
        if let Some(array_segment) = index.array_segment() {
            if !self.has_matching_equality_filter(array_segment) {
                return false;
            }
        }

        let segments: Vec<&IndexSegment> = index.directional_segments().collect();
        let order_by: Vec<&OrderBy> = self.target.order_by.iter().collect();
        let mut equality_fields = BTreeSet::new();
        let mut segment_index = 0;
        while segment_index < segments.len()
            && self.has_matching_equality_filter(segments[segment_index])
        {
            equality_fields.insert(&segments[segment_index].field_path);
            segment_index += 1;
        }
        if segment_index == segments.len() {
            return true;
        }

        let mut order_by_index = 0;
        if let Some(inequality_field) = self.inequality_fields.first() {
            if !equality_fields.contains(inequality_field) {
                let segment = segments[segment_index];
                let first_order = order_by.first();
                if &&segment.field_path != inequality_field
                    || !first_order
                        .map(|order| matches_order_by(order, segment))
                        .unwrap_or(false)
                {
                    return false;
                }
                order_by_index = 1;
                segment_index += 1;
            }
        }

        while segment_index < segments.len() {
            let segment = segments[segment_index];
            match order_by.get(order_by_index) {
                Some(order) if matches_order_by(order, segment) => {}
                _ => return false,
            }
            order_by_index += 1;
            segment_index += 1;
        }
        true
    }

    fn build_target_index(&self) -> Option<FieldIndex> {
        if self.inequality_fields.len() > 1 {
            return None;
        }
        let collection_group = self.target.collection_group_id()?;
        let mut unique_fields = BTreeSet::new();
        let mut segments = Vec::new();
        let mut has_array_segment = false;
        for filter in &self.equality_filters {
            if filter.field().is_key_field() {
                continue;
            }
            let is_array = matches!(
                filter.operator(),
                FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
            );
            if is_array {
                if !has_array_segment {
                    segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Contains));
                    has_array_segment = true;
                }
            } else if unique_fields.insert(filter.field().clone()) {
                segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Ascending));
            }
        }
        for order in &self.target.order_by {
            if order.field().is_key_field() {
                continue;
            }
            if unique_fields.insert(order.field().clone()) {
                let kind = match order.direction() {
                    OrderDirection::Ascending => IndexKind::Ascending,
                    OrderDirection::Descending => IndexKind::Descending,
                };
                segments.push(IndexSegment::new(order.field().clone(), kind));
            }
        }
        if segments.is_empty() {
            return None;
        }
        Some(FieldIndex::new(collection_group, segments))
    }
}

fn matches_filter(filter: &FieldFilter, segment: &IndexSegment) -> bool {
    if filter.field() != &segment.field_path {
        return false;
    }
    let is_array = matches!(
        filter.operator(),
        FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
    );
    is_array == (segment.kind == IndexKind::Contains)
}

fn matches_order_by(order: &OrderBy, segment: &IndexSegment) -> bool {
    if order.field() != &segment.field_path {
        return false;
    }
    matches!(
        (segment.kind, order.direction()),
        (IndexKind::Ascending, OrderDirection::Ascending)
            | (IndexKind::Descending, OrderDirection::Descending)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::model::Timestamp;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn equality_query(name: &str, value: i64) -> Query {
        Query::collection("coll").unwrap().with_filter(
            FieldFilter::new(field(name), FilterOperator::Equal, FirestoreValue::from_integer(value))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn index_type_reflects_coverage() {
        let persistence = MemoryPersistence::new("client");
        let manager = MemoryIndexManager::new("user");
        let query = equality_query("a", 1)
            .with_order_by(OrderBy::new(field("b"), OrderDirection::Ascending));
        let target = query.to_target();

        let (none, partial, full) = persistence
            .run_transaction("types", PersistenceTransactionMode::ReadWrite, |txn| {
                let none = manager.get_index_type(txn, &target);
                manager.add_field_index(
                    txn,
                    FieldIndex::new("coll", vec![IndexSegment::new(field("a"), IndexKind::Ascending)]),
                )?;
                let partial = manager.get_index_type(txn, &target);
                manager.create_target_indexes(txn, &target)?;
                let full = manager.get_index_type(txn, &target);
                Ok((none, partial, full))
            })
            .await
            .unwrap();
        assert_eq!(none, IndexType::None);
        assert_eq!(partial, IndexType::Partial);
        assert_eq!(full, IndexType::Full);
    }

    #[tokio::test]
    async fn matching_uses_entries_in_index_order() {
        let persistence = MemoryPersistence::new("client");
        let manager = MemoryIndexManager::new("user");
        let query = Query::collection("coll")
            .unwrap()
            .with_filter(
                FieldFilter::new(
                    field("count"),
                    FilterOperator::GreaterThan,
                    FirestoreValue::from_integer(1),
                )
                .unwrap(),
            );
        let target = query.to_target();
        let keys = persistence
            .run_transaction("match", PersistenceTransactionMode::ReadWrite, |txn| {
                manager.add_field_index(
                    txn,
                    FieldIndex::new(
                        "coll",
                        vec![IndexSegment::new(field("count"), IndexKind::Ascending)],
                    ),
                )?;
                let documents: BTreeMap<DocumentKey, MutableDocument> = [
                    doc("coll/a", &[("count", FirestoreValue::from_integer(5))]),
                    doc("coll/b", &[("count", FirestoreValue::from_integer(1))]),
                    doc("coll/c", &[("count", FirestoreValue::from_integer(3))]),
                    doc("coll/d", &[]),
                ]
                .into_iter()
                .map(|doc| (doc.key().clone(), doc))
                .collect();
                manager.update_index_entries(txn, &documents)?;
                Ok(manager.get_documents_matching_target(txn, &target))
            })
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<&str> = keys.iter().map(|key| key.id()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn contains_segments_index_each_element() {
        let persistence = MemoryPersistence::new("client");
        let manager = MemoryIndexManager::new("user");
        let query = Query::collection("coll").unwrap().with_filter(
            FieldFilter::new(
                field("tags"),
                FilterOperator::ArrayContains,
                FirestoreValue::from_string("red"),
            )
            .unwrap(),
        );
        let target = query.to_target();
        let keys = persistence
            .run_transaction("contains", PersistenceTransactionMode::ReadWrite, |txn| {
                manager.create_target_indexes(txn, &target)?;
                let documents: BTreeMap<DocumentKey, MutableDocument> = [
                    doc(
                        "coll/a",
                        &[(
                            "tags",
                            FirestoreValue::from_array(vec![
                                FirestoreValue::from_string("red"),
                                FirestoreValue::from_string("blue"),
                            ]),
                        )],
                    ),
                    doc(
                        "coll/b",
                        &[("tags", FirestoreValue::from_array(vec![FirestoreValue::from_string("blue")]))],
                    ),
                ]
                .into_iter()
                .map(|doc| (doc.key().clone(), doc))
                .collect();
                manager.update_index_entries(txn, &documents)?;
                Ok(manager.get_documents_matching_target(txn, &target))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(keys, vec![DocumentKey::from_string("coll/a").unwrap()]);
    }

    #[tokio::test]
    async fn least_recently_updated_group_goes_first() {
        let persistence = MemoryPersistence::new("client");
        let manager = MemoryIndexManager::new("user");
        let (first, second) = persistence
            .run_transaction("groups", PersistenceTransactionMode::ReadWrite, |txn| {
                manager.add_field_index(
                    txn,
                    FieldIndex::new("a", vec![IndexSegment::new(field("x"), IndexKind::Ascending)]),
                )?;
                manager.add_field_index(
                    txn,
                    FieldIndex::new("b", vec![IndexSegment::new(field("x"), IndexKind::Ascending)]),
                )?;
                let first = manager.get_next_collection_group_to_update(txn);
                manager.update_collection_group(txn, "a", IndexOffset::none())?;
                let second = manager.get_next_collection_group_to_update(txn);
                Ok((first, second))
            })
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
    }
}
