use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Ordered field map; also serves as the data of a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value at `path`, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current.kind() {
                ValueKind::Map(map) => map.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating (or replacing non-map values with)
    /// intermediate maps as needed.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_in_fields(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Missing parents are left untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_in_fields(&mut self.fields, path.segments());
    }

    /// Mask of every leaf path in this map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        FieldMask::new(paths)
    }

    pub fn approximate_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + 1 + value.approximate_size())
            .sum()
    }
}

fn set_in_fields(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.fields,
        _ => BTreeMap::new(),
    };
    set_in_fields(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_in_fields(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    let Some(existing) = fields.get(first) else {
        return;
    };
    let ValueKind::Map(map) = existing.kind() else {
        return;
    };
    let mut child = map.fields.clone();
    delete_in_fields(&mut child, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.fields.is_empty() => {
                collect_leaf_paths(&map.fields, prefix, out);
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.fields().get("foo"), map.get("foo"));
    }

    #[test]
    fn set_get_delete_nested_paths() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        map.set(&path("a.d"), FirestoreValue::from_bool(true));
        assert_eq!(map.get(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.get(&path("a.b.c.x")).is_none());

        map.delete(&path("a.b.c"));
        assert!(map.get(&path("a.b.c")).is_none());
        assert_eq!(map.get(&path("a.d")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("c"), FirestoreValue::null());
        let mask = map.field_mask();
        assert_eq!(mask.paths(), &[path("a.b"), path("c")]);
    }
}
