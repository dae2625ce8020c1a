use std::collections::BTreeSet;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// Ordered, de-duplicated set of field paths.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldMask {
    paths: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(paths: Vec<FieldPath>) -> Self {
        let set: BTreeSet<FieldPath> = paths.into_iter().collect();
        Self {
            paths: set.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> &[FieldPath] {
        &self.paths
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// True when `path` is one of the mask's paths or nested below one.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.paths.iter().any(|candidate| candidate.is_prefix_of(path))
    }

    pub fn union_with<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let mut paths = self.paths.clone();
        paths.extend(extra);
        Self::new(paths)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Server outcome of one mutation in an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Replaces only the fields named in `field_mask`. Masked paths missing
    /// from `data` are deleted.
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Only checks the precondition; used to verify reads.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    /// Full overwrite. Sentinel values in `data` become field transforms.
    pub fn set(key: DocumentKey, data: MapValue) -> FirestoreResult<Self> {
        let (value, field_transforms) = extract_sentinels(data)?;
        Ok(Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms,
        })
    }

    /// Update of existing fields; fails remotely if the document is missing.
    pub fn update(key: DocumentKey, data: MapValue) -> FirestoreResult<Self> {
        Self::patch_with_precondition(key, data, Precondition::Exists(true))
    }

    /// Set with merge: creates the document when missing.
    pub fn merge(key: DocumentKey, data: MapValue) -> FirestoreResult<Self> {
        Self::patch_with_precondition(key, data, Precondition::None)
    }

    fn patch_with_precondition(
        key: DocumentKey,
        data: MapValue,
        precondition: Precondition,
    ) -> FirestoreResult<Self> {
        let (data, field_transforms) = extract_sentinels(data)?;
        let field_mask = data.field_mask();
        Ok(Mutation::Patch {
            key,
            data,
            field_mask,
            precondition,
            field_transforms,
        })
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set {
                field_transforms, ..
            }
            | Mutation::Patch {
                field_transforms, ..
            } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// Applies the acknowledged mutation to the last known remote document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match self {
            Mutation::Set {
                value,
                field_transforms,
                ..
            } => {
                let mut new_data = value.clone();
                let transform_results =
                    server_transform_results(field_transforms, document, result);
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    // The server applied the patch against a document we
                    // never saw, so its contents are unknown.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results =
                    server_transform_results(field_transforms, document, result);
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, data, field_mask);
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the mutation to the local view of a document.
    ///
    /// `previous_mask` is the set of fields changed by earlier mutations
    /// (`None` meaning the whole document). Returns the updated mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        match self {
            Mutation::Set {
                value,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let transform_results =
                    local_transform_results(field_transforms, local_write_time, document);
                let mut new_data = value.clone();
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                field_transforms,
                ..
            } => {
                if !precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let transform_results =
                    local_transform_results(field_transforms, local_write_time, document);
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, data, field_mask);
                apply_transform_results(&mut new_data, field_transforms, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();

                let previous_mask = previous_mask?;
                Some(
                    previous_mask
                        .union_with(field_mask.paths().iter().cloned())
                        .union_with(field_transforms.iter().map(|t| t.field_path().clone())),
                )
            }
            Mutation::Delete { precondition, .. } => {
                if precondition.is_valid_for(document) {
                    let version = document.version();
                    document
                        .convert_to_no_document(version)
                        .set_has_local_mutations();
                    return None;
                }
                previous_mask
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Base values needed to replay non-idempotent transforms (increments)
    /// against the state the user saw when writing.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in self.field_transforms() {
            let existing = document.field(transform.field_path());
            if let Some(coerced) = transform_base_value(transform.operation(), existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field_path(), coerced);
            }
        }
        base
    }
}

/// Net mutation that turns the remote document into `document`, given the
/// fields `mask` touched by pending writes (`None` for the whole document).
pub fn calculate_overlay_mutation(
    document: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::Set {
            key: document.key().clone(),
            value: document.data().clone(),
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        });
    };
    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut mask_set = BTreeSet::new();
    for path in mask.paths() {
        if mask_set.contains(path) {
            continue;
        }
        let mut target = path.clone();
        let mut value = data.get(&target);
        // A nested path whose value vanished is represented by its parent.
        if value.is_none() {
            if let Some(parent) = target.parent() {
                value = data.get(&parent);
                target = parent;
            }
        }
        match value {
            Some(value) => patch.set(&target, value.clone()),
            None => patch.delete(&target),
        }
        mask_set.insert(target);
    }

    Some(Mutation::Patch {
        key: document.key().clone(),
        data: patch,
        field_mask: FieldMask::new(mask_set.into_iter().collect()),
        precondition: Precondition::None,
        field_transforms: Vec::new(),
    })
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
    for path in mask.paths() {
        match data.get(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn apply_transform_results(
    target: &mut MapValue,
    transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) {
    for (transform, value) in transforms.iter().zip(results) {
        target.set(transform.field_path(), value);
    }
}

fn local_transform_results(
    transforms: &[FieldTransform],
    local_write_time: Timestamp,
    document: &MutableDocument,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .map(|transform| {
            let previous = document.field(transform.field_path()).cloned();
            apply_transform_to_local_view(transform.operation(), previous, local_write_time)
        })
        .collect()
}

fn server_transform_results(
    transforms: &[FieldTransform],
    document: &MutableDocument,
    result: &MutationResult,
) -> Vec<FirestoreValue> {
    transforms
        .iter()
        .enumerate()
        .map(|(index, transform)| {
            let previous = document.field(transform.field_path()).cloned();
            match transform.operation() {
                TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
                TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
                operation => match result.transform_results.get(index) {
                    Some(value) => value.clone(),
                    None => apply_transform_to_local_view(
                        operation,
                        previous,
                        result.version.timestamp(),
                    ),
                },
            }
        })
        .collect()
}

fn apply_transform_to_local_view(
    operation: &TransformOperation,
    previous: Option<FirestoreValue>,
    local_write_time: Timestamp,
) -> FirestoreValue {
    match operation {
        TransformOperation::ServerTimestamp => {
            FirestoreValue::pending_server_timestamp(local_write_time, previous)
        }
        TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
        TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        TransformOperation::NumericIncrement(operand) => {
            let base = transform_base_value(operation, previous.as_ref())
                .unwrap_or_else(|| FirestoreValue::from_integer(0));
            numeric_increment(&base, operand)
        }
    }
}

fn transform_base_value(
    operation: &TransformOperation,
    previous: Option<&FirestoreValue>,
) -> Option<FirestoreValue> {
    match operation {
        TransformOperation::NumericIncrement(_) => match previous {
            Some(value) if value.is_number() => Some(value.clone()),
            _ => Some(FirestoreValue::from_integer(0)),
        },
        _ => None,
    }
}

fn array_union(existing: Option<FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerce_array(existing);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let filtered: Vec<FirestoreValue> = coerce_array(existing)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(filtered)
}

fn coerce_array(existing: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match existing.map(FirestoreValue::into_kind) {
        Some(ValueKind::Array(array)) => array.values().to_vec(),
        _ => Vec::new(),
    }
}

// Integer overflow saturates, matching the backend.
fn numeric_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

/// Splits sentinel values out of user data, returning the plain data and
/// the equivalent field transforms.
pub fn extract_sentinels(data: MapValue) -> FirestoreResult<(MapValue, Vec<FieldTransform>)> {
    let mut transforms = Vec::new();
    let mut cleaned = MapValue::empty();
    collect_sentinels(data, &mut Vec::new(), &mut cleaned, &mut transforms)?;
    Ok((cleaned, transforms))
}

fn collect_sentinels(
    data: MapValue,
    prefix: &mut Vec<String>,
    cleaned: &mut MapValue,
    transforms: &mut Vec<FieldTransform>,
) -> FirestoreResult<()> {
    for (key, value) in data.into_fields() {
        prefix.push(key);
        let path = FieldPath::new(prefix.clone())?;
        match value.into_kind() {
            ValueKind::Sentinel(sentinel) => {
                let operation = match sentinel {
                    SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
                    SentinelValue::ArrayUnion(elements) => TransformOperation::ArrayUnion(elements),
                    SentinelValue::ArrayRemove(elements) => {
                        TransformOperation::ArrayRemove(elements)
                    }
                    SentinelValue::NumericIncrement(operand) => {
                        if !operand.is_number() {
                            return Err(invalid_argument(
                                "FieldValue.increment() requires a numeric operand",
                            ));
                        }
                        TransformOperation::NumericIncrement(*operand)
                    }
                };
                transforms.push(FieldTransform::new(path, operation));
            }
            ValueKind::Map(map) if !map.is_empty() => {
                collect_sentinels(map, prefix, cleaned, transforms)?;
            }
            other => cleaned.set(&path, FirestoreValue::from_kind(other)),
        }
        prefix.pop();
    }
    Ok(())
}
