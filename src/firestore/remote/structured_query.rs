use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::{Bound, FieldFilter, FilterOperator, Target};
use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// Encodes a collection or collection-group target as a `QueryTarget`
/// (`parent` plus `structuredQuery`).
pub(crate) fn encode_query_target(
    serializer: &JsonProtoSerializer,
    target: &Target,
) -> FirestoreResult<JsonValue> {
    let mut structured = serde_json::Map::new();

    let (parent, from_entry) = match &target.collection_group {
        Some(group) => (
            serializer.resource_name(&target.path),
            json!({ "collectionId": group, "allDescendants": true }),
        ),
        None => (
            serializer.resource_name(&target.path.without_last()),
            json!({ "collectionId": target.path.last_segment().unwrap_or_default() }),
        ),
    };
    structured.insert("from".to_string(), JsonValue::Array(vec![from_entry]));

    if !target.filters.is_empty() {
        structured.insert(
            "where".to_string(),
            encode_filters(serializer, &target.filters)?,
        );
    }

    if !target.order_by.is_empty() {
        let orders: Vec<_> = target
            .order_by
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": order.direction().as_str(),
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit {
        structured.insert("limit".to_string(), json!(limit as i64));
    }

    if let Some(start) = &target.start_at {
        structured.insert(
            "startAt".to_string(),
            encode_cursor(serializer, start, start.inclusive())?,
        );
    }

    if let Some(end) = &target.end_at {
        structured.insert(
            "endAt".to_string(),
            encode_cursor(serializer, end, !end.inclusive())?,
        );
    }

    Ok(json!({
        "parent": parent,
        "structuredQuery": JsonValue::Object(structured),
    }))
}

fn encode_filters(
    serializer: &JsonProtoSerializer,
    filters: &[FieldFilter],
) -> FirestoreResult<JsonValue> {
    if let [filter] = filters {
        return encode_field_filter(serializer, filter);
    }

    let nested = filters
        .iter()
        .map(|filter| encode_field_filter(serializer, filter))
        .collect::<FirestoreResult<Vec<_>>>()?;

    Ok(json!({
        "compositeFilter": {
            "op": "AND",
            "filters": nested
        }
    }))
}

fn encode_field_filter(
    serializer: &JsonProtoSerializer,
    filter: &FieldFilter,
) -> FirestoreResult<JsonValue> {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    let unary = match filter.operator() {
        FilterOperator::Equal if filter.value().is_null() => Some("IS_NULL"),
        FilterOperator::Equal if filter.value().is_nan() => Some("IS_NAN"),
        FilterOperator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
        FilterOperator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    if let Some(op) = unary {
        return Ok(json!({ "unaryFilter": { "field": field, "op": op } }));
    }
    Ok(json!({
        "fieldFilter": {
            "field": field,
            "op": filter.operator().as_str(),
            "value": serializer.encode_value(filter.value())?
        }
    }))
}

fn encode_cursor(
    serializer: &JsonProtoSerializer,
    bound: &Bound,
    before: bool,
) -> FirestoreResult<JsonValue> {
    let values = bound
        .values()
        .iter()
        .map(|value| serializer.encode_value(value))
        .collect::<FirestoreResult<Vec<_>>>()?;
    Ok(json!({ "values": values, "before": before }))
}
