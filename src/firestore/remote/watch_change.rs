use serde_json::Value as JsonValue;

use crate::firestore::core::types::TargetId;
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::rpc_error::RpcStatus;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded message of the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Only set together with `Removed` when the backend rejected the target.
    pub cause: Option<FirestoreError>,
}

/// A document now matching `updated_target_ids` and no longer matching
/// `removed_target_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub document: MutableDocument,
}

/// The document was deleted at `read_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

/// The document left the targets' result sets; its new state is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// Raw bloom filter as sent with an existence filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: u32,
}

impl WatchChange {
    pub fn removed_target_ids(&self) -> &[TargetId] {
        match self {
            WatchChange::DocumentChange(change) => &change.removed_target_ids,
            WatchChange::DocumentDelete(change) => &change.removed_target_ids,
            WatchChange::DocumentRemove(change) => &change.removed_target_ids,
            _ => &[],
        }
    }
}

/// Decodes a `ListenResponse`. Unknown response kinds yield `None`.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(serializer, filter).map(Some);
    }
    Ok(None)
}

/// Global snapshot version carried by a response. Only a target change that
/// names no targets establishes a consistent snapshot.
pub fn snapshot_version_from_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    serializer.decode_optional_version(target_change.get("readTime"))
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<RpcStatus>(cause.clone()))
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .map(RpcStatus::into_error);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: serializer.decode_bytes(value.get("resumeToken"))?,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        document: serializer.decode_found_document(document)?,
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    Ok(WatchChange::DocumentDelete(DocumentDelete {
        key: decode_document_name(serializer, value, "documentDelete")?,
        read_time: serializer.decode_optional_version(value.get("readTime"))?,
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    Ok(WatchChange::DocumentRemove(DocumentRemove {
        key: decode_document_name(serializer, value, "documentRemove")?,
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
    }))
}

fn decode_filter_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    // The backend omits zero counts.
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(|names| decode_bloom_filter(serializer, names))
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn decode_bloom_filter(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<BloomFilterPayload> {
    let bits = value.get("bits");
    Ok(BloomFilterPayload {
        bitmap: serializer.decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
        padding: bits
            .and_then(|bits| bits.get("padding"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as u32,
        hash_count: value
            .get("hashCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as u32,
    })
}

fn decode_document_name(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "ADD" => WatchTargetChangeState::Added,
        "REMOVE" => WatchTargetChangeState::Removed,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}
