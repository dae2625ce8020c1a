use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{compare_values, type_order, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    /// Name used by the structured query wire format.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

/// Comparison of one document field against a constant.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        operator: FilterOperator,
        value: FirestoreValue,
    ) -> FirestoreResult<Self> {
        let needs_array = matches!(
            operator,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::ArrayContainsAny
        );
        if needs_array && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{}' filters.",
                operator.symbol()
            )));
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match document_field_value(document, &self.field) {
            Some(value) => evaluate_filter(self, &value),
            None => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.symbol(),
            self.value.canonical_string()
        )
    }
}

fn evaluate_filter(filter: &FieldFilter, value: &FirestoreValue) -> bool {
    let expected = filter.value();
    match filter.operator() {
        FilterOperator::ArrayContains => match value.as_array() {
            Some(array) => array.contains(expected),
            None => false,
        },
        FilterOperator::ArrayContainsAny => match (value.as_array(), expected.as_array()) {
            (Some(array), Some(needles)) => {
                needles.values().iter().any(|needle| array.contains(needle))
            }
            _ => false,
        },
        FilterOperator::In => match expected.as_array() {
            Some(values) => values.contains(value),
            None => false,
        },
        FilterOperator::NotIn => match expected.as_array() {
            Some(values) => !value.is_null() && !values.contains(value),
            None => false,
        },
        FilterOperator::NotEqual => {
            !value.is_null() && compare_values(value, expected) != Ordering::Equal
        }
        operator => {
            // Range and equality filters only match values of the same type.
            if type_order(value) != type_order(expected) {
                return false;
            }
            let ordering = compare_values(value, expected);
            match operator {
                FilterOperator::LessThan => ordering == Ordering::Less,
                FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
                FilterOperator::Equal => ordering == Ordering::Equal,
                FilterOperator::GreaterThan => ordering == Ordering::Greater,
                FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
                _ => false,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASCENDING",
            OrderDirection::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (
                left.field(&self.field),
                right.field(&self.field),
            ) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position in terms of the order-by values.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn canonical_id(&self) -> String {
        let values: Vec<String> = self
            .values
            .iter()
            .map(FirestoreValue::canonical_string)
            .collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// What the local engine and the backend agree to listen to. Derived from a
/// [`Query`] with the order-by fully normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Single-document target, used for limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Query::new(key.path().clone()).to_target()
    }

    pub fn is_document_target(&self) -> bool {
        self.collection_group.is_none()
            && self.filters.is_empty()
            && self.path.len() % 2 == 0
            && !self.path.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.field.canonical_string());
            id.push_str(match order.direction {
                OrderDirection::Ascending => "asc",
                OrderDirection::Descending => "desc",
            });
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }

    /// Collection group whose documents this target may return.
    pub fn collection_group_id(&self) -> Option<&str> {
        match &self.collection_group {
            Some(group) => Some(group.as_str()),
            None if self.is_document_target() => self.path.segment(self.path.len() - 2),
            None => self.path.last_segment(),
        }
    }

    /// Fields constrained by inequality filters.
    pub fn inequality_fields(&self) -> Vec<&FieldPath> {
        let mut fields: Vec<&FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.operator().is_inequality())
            .map(FieldFilter::field)
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

/// Collection (or collection group, or single document) query with filters,
/// ordering, limit and cursors.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection at `path`, or the single document when `path`
    /// has an even number of segments.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection path '{}': must have an odd number of segments",
                path.canonical_string()
            )));
        }
        Ok(Self::new(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(
                "Collection group id must be a non-empty string without '/'",
            ));
        }
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id);
        Ok(query)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.explicit_order_by.push(order);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    /// Same query without its limit, so every match is returned.
    pub fn without_limit(&self) -> Self {
        Self {
            limit: None,
            limit_type: LimitType::First,
            ..self.clone()
        }
    }

    /// Collection query over `path` with this query's constraints; used to
    /// run a collection group query one parent at a time.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        self.collection_group.is_none()
            && self.filters.is_empty()
            && !self.path.is_empty()
            && self.path.len() % 2 == 0
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when every document in the collection matches.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && self
                .explicit_order_by
                .iter()
                .all(|order| order.field.is_key_field())
    }

    /// Explicit order-by followed by implicit orderings on inequality fields
    /// and finally the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let last_direction = result
            .last()
            .map(OrderBy::direction)
            .unwrap_or(OrderDirection::Ascending);

        let mut inequality_fields: Vec<&FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.operator().is_inequality())
            .map(FieldFilter::field)
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();
        for field in inequality_fields {
            if field.is_key_field() {
                continue;
            }
            if !result.iter().any(|order| &order.field == field) {
                result.push(OrderBy::new(field.clone(), last_direction));
            }
        }

        if !result.iter().any(|order| order.field.is_key_field()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            // Limit-to-last runs as a flipped limit-to-first on the backend.
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Whether `document` belongs in this query's result set, ignoring limit.
    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document.key())
            && self.matches_order_by(document)
            && self.matches_filters(document)
            && self.matches_bounds(document)
    }

    pub fn matches_path_and_collection_group(&self, key: &DocumentKey) -> bool {
        let document_path = key.path();
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if self.is_document_query() {
            &self.path == document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by().iter().all(|order| {
            order.field.is_key_field() || document.field(&order.field).is_some()
        })
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if is_before_start_bound(document, bound, &order_by) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if is_after_end_bound(document, bound, &order_by) {
                return false;
            }
        }
        true
    }

    /// Comparator over the normalized order-by. The key is always last.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        compare_with_order_by(&self.normalized_order_by(), left, right)
    }

    /// Sorts the candidates and keeps the ones the limit admits.
    pub fn apply_to_documents(&self, documents: Vec<MutableDocument>) -> Vec<MutableDocument> {
        let order_by = self.normalized_order_by();
        let mut filtered: Vec<MutableDocument> =
            documents.into_iter().filter(|doc| self.matches(doc)).collect();
        filtered.sort_by(|left, right| compare_with_order_by(&order_by, left, right));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if filtered.len() > limit {
                match self.limit_type {
                    LimitType::First => filtered.truncate(limit),
                    LimitType::Last => {
                        let start = filtered.len() - limit;
                        filtered.drain(0..start);
                    }
                }
            }
        }
        filtered
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

pub(crate) fn compare_with_order_by(
    order_by: &[OrderBy],
    left: &MutableDocument,
    right: &MutableDocument,
) -> Ordering {
    for order in order_by {
        let ordering = order.compare(left, right);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.key().cmp(right.key())
}

/// Value of `field` in `document`, mapping `__name__` to a reference to the
/// document itself.
pub fn document_field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

fn is_before_start_bound(document: &MutableDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_document_to_bound(document, bound, order_by);
    if bound.inclusive() {
        ordering == Ordering::Less
    } else {
        ordering != Ordering::Greater
    }
}

fn is_after_end_bound(document: &MutableDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_document_to_bound(document, bound, order_by);
    if bound.inclusive() {
        ordering == Ordering::Greater
    } else {
        ordering != Ordering::Less
    }
}

fn compare_document_to_bound(
    document: &MutableDocument,
    bound: &Bound,
    order_by: &[OrderBy],
) -> Ordering {
    for (order, bound_value) in order_by.iter().zip(bound.values()) {
        let document_value =
            document_field_value(document, order.field()).unwrap_or_else(FirestoreValue::null);
        let mut ordering = match (order.field.is_key_field(), bound_value.kind()) {
            (true, ValueKind::Reference(reference)) => match DocumentKey::from_string(reference) {
                Ok(bound_key) => document.key().cmp(&bound_key),
                Err(_) => compare_values(&document_value, bound_value),
            },
            _ => compare_values(&document_value, bound_value),
        };
        if order.direction() == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, population: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("population").unwrap(),
            FirestoreValue::from_integer(population),
        );
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn population() -> FieldPath {
        FieldPath::from_dot_separated("population").unwrap()
    }

    #[test]
    fn applies_limit_and_ordering() {
        let query = Query::collection("cities")
            .unwrap()
            .with_order_by(OrderBy::new(population(), OrderDirection::Ascending))
            .with_limit_to_first(2);

        let result = query.apply_to_documents(vec![
            doc("cities/sf", 100),
            doc("cities/nyc", 50),
            doc("cities/la", 75),
        ]);
        let ids: Vec<&str> = result.iter().map(|doc| doc.key().id()).collect();
        assert_eq!(ids, vec!["nyc", "la"]);
    }

    #[test]
    fn limit_to_last_keeps_tail_and_flips_target() {
        let query = Query::collection("cities")
            .unwrap()
            .with_order_by(OrderBy::new(population(), OrderDirection::Ascending))
            .with_limit_to_last(1);
        let result = query.apply_to_documents(vec![doc("cities/sf", 100), doc("cities/la", 75)]);
        assert_eq!(result[0].key().id(), "sf");

        let target = query.to_target();
        assert!(target
            .order_by
            .iter()
            .all(|order| order.direction() == OrderDirection::Descending));
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(1).canonical_id()
        );
    }

    #[test]
    fn range_filters_require_matching_types() {
        let filter = FieldFilter::new(
            population(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(60),
        )
        .unwrap();
        assert!(filter.matches(&doc("cities/sf", 100)));
        assert!(!filter.matches(&doc("cities/nyc", 50)));

        let mut text = MapValue::empty();
        text.set(&population(), FirestoreValue::from_string("many"));
        let string_doc = MutableDocument::new_found_document(
            DocumentKey::from_string("cities/x").unwrap(),
            SnapshotVersion::min(),
            text,
        );
        assert!(!filter.matches(&string_doc));
    }

    #[test]
    fn inequality_adds_implicit_order_by() {
        let query = Query::collection("cities").unwrap().with_filter(
            FieldFilter::new(
                population(),
                FilterOperator::LessThan,
                FirestoreValue::from_integer(10),
            )
            .unwrap(),
        );
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].field(), &population());
        assert!(order_by[1].field().is_key_field());
    }

    #[test]
    fn path_matching_distinguishes_collections_and_groups() {
        let key = DocumentKey::from_string("rooms/a/messages/m1").unwrap();
        assert!(Query::collection("rooms/a/messages")
            .unwrap()
            .matches_path_and_collection_group(&key));
        assert!(!Query::collection("rooms")
            .unwrap()
            .matches_path_and_collection_group(&key));
        assert!(Query::collection_group("messages")
            .unwrap()
            .matches_path_and_collection_group(&key));
        assert!(Query::for_document(&key).matches_path_and_collection_group(&key));
    }

    #[test]
    fn start_after_excludes_bound_document() {
        let query = Query::collection("cities")
            .unwrap()
            .with_order_by(OrderBy::new(population(), OrderDirection::Ascending))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(75)], false));
        let result = query.apply_to_documents(vec![doc("cities/la", 75), doc("cities/sf", 100)]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key().id(), "sf");
    }
}
