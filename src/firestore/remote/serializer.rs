use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, MutableDocument, Mutation, MutationResult,
    Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_query_target;
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Encodes engine types into the JSON mapping of the Firestore v1 protos and
/// decodes backend responses.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Parses a fully qualified document name. Names from another database
    /// are rejected.
    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Tried to deserialize key from different database: {name}"
                ))
            })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> FirestoreResult<JsonValue> {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, map: &MapValue) -> FirestoreResult<JsonValue> {
        encode_map_fields(map)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(parse_timestamp(value)?))
    }

    pub fn decode_optional_version(
        &self,
        value: Option<&JsonValue>,
    ) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(timestamp) => self.decode_version(timestamp),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
        match value.and_then(JsonValue::as_str) {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
            None => Ok(Vec::new()),
        }
    }

    /// Decodes a `Document` message into a found document at its update time.
    pub fn decode_found_document(&self, document: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = document
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing a name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_optional_version(document.get("updateTime"))?;
        if version.is_min() {
            return Err(invalid_argument(format!(
                "Document {name} is missing an update time"
            )));
        }
        let data = decode_map_value(document)?;
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    /// Encodes a mutation as a `Write` message.
    pub fn encode_mutation(&self, mutation: &Mutation) -> FirestoreResult<JsonValue> {
        let mut write = serde_json::Map::new();
        match mutation {
            Mutation::Set {
                key,
                value,
                field_transforms,
                ..
            } => {
                write.insert("update".to_string(), self.encode_document(key, value)?);
                self.insert_transforms(&mut write, field_transforms)?;
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                field_transforms,
                ..
            } => {
                write.insert("update".to_string(), self.encode_document(key, data)?);
                let paths: Vec<String> = field_mask
                    .paths()
                    .iter()
                    .map(|path| path.canonical_string())
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
                self.insert_transforms(&mut write, field_transforms)?;
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }
        if let Some(precondition) = self.encode_precondition(mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        Ok(JsonValue::Object(write))
    }

    /// Decodes one `WriteResult`. Results without an update time (e.g. for
    /// deletes) take the commit version.
    pub fn decode_write_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = self.decode_optional_version(value.get("updateTime"))?;
        if version.is_min() {
            version = commit_version;
        }
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(decode_value)
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    /// Encodes the `addTarget` body of a listen request.
    pub fn encode_listen_target(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        if target_data.target.is_document_target() {
            encoded.insert(
                "documents".to_string(),
                self.encode_documents_target(&target_data.target),
            );
        } else {
            encoded.insert(
                "query".to_string(),
                encode_query_target(self, &target_data.target)?,
            );
        }

        let has_resume_state = if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
            true
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".to_string(),
                json!(self.encode_version(&target_data.snapshot_version)),
            );
            true
        } else {
            false
        };
        if has_resume_state {
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".to_string(), json!(expected_count));
            }
        }
        Ok(JsonValue::Object(encoded))
    }

    /// Labels attached to a listen request so backend metrics can tell
    /// re-listens apart from user listens.
    pub fn encode_listen_request_labels(
        &self,
        target_data: &TargetData,
    ) -> Option<BTreeMap<String, String>> {
        let value = match target_data.purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        let mut labels = BTreeMap::new();
        labels.insert("goog-listen-tags".to_string(), value.to_string());
        Some(labels)
    }

    fn encode_documents_target(&self, target: &Target) -> JsonValue {
        json!({ "documents": [self.resource_name(&target.path)] })
    }

    fn encode_document(&self, key: &DocumentKey, data: &MapValue) -> FirestoreResult<JsonValue> {
        Ok(json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(data)?,
        }))
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(version) }))
            }
        }
    }

    fn insert_transforms(
        &self,
        write: &mut serde_json::Map<String, JsonValue>,
        transforms: &[FieldTransform],
    ) -> FirestoreResult<()> {
        if transforms.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::with_capacity(transforms.len());
        for transform in transforms {
            let field_path = transform.field_path().canonical_string();
            let json = match transform.operation() {
                TransformOperation::ServerTimestamp => json!({
                    "fieldPath": field_path,
                    "setToServerValue": "REQUEST_TIME"
                }),
                TransformOperation::ArrayUnion(elements) => json!({
                    "fieldPath": field_path,
                    "appendMissingElements": { "values": encode_values(elements)? }
                }),
                TransformOperation::ArrayRemove(elements) => json!({
                    "fieldPath": field_path,
                    "removeAllFromArray": { "values": encode_values(elements)? }
                }),
                TransformOperation::NumericIncrement(operand) => json!({
                    "fieldPath": field_path,
                    "increment": encode_value(operand)?
                }),
            };
            encoded.push(json);
        }
        write.insert("updateTransforms".to_string(), JsonValue::Array(encoded));
        Ok(())
    }
}

fn encode_values(values: &[FirestoreValue]) -> FirestoreResult<Vec<JsonValue>> {
    values.iter().map(encode_value).collect()
}

fn encode_map_fields(map: &MapValue) -> FirestoreResult<JsonValue> {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value)?);
    }
    Ok(JsonValue::Object(fields))
}

fn encode_value(value: &FirestoreValue) -> FirestoreResult<JsonValue> {
    Ok(match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => json!({ "arrayValue": { "values": encode_values(array.values())? } }),
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)?
            }
        }),
        ValueKind::ServerTimestamp(_) | ValueKind::Sentinel(_) => {
            return Err(invalid_argument(
                "Sentinel and pending server timestamp values cannot be sent as field values",
            ))
        }
    })
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            latitude, longitude,
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    let datetime: DateTime<Utc> = Utc
        .timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_default();
    datetime.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
