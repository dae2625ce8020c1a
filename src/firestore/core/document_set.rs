use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents of a view, kept in the order of the view's query.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Query,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    /// An empty set ordered by `query`'s comparator.
    pub fn new(query: &Query) -> Self {
        Self {
            query: query.clone(),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.query.compare_documents(left, right)
    }

    /// Inserts `document`, replacing any entry with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let position = match self.position(&document) {
            Ok(position) | Err(position) => position,
        };
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let document = self.by_key.remove(key)?;
        if let Ok(position) = self.position(&document) {
            self.sorted.remove(position);
        } else {
            self.sorted.retain(|existing| existing.key() != key);
        }
        Some(document)
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.query.compare_documents(probe, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a MutableDocument;
    type IntoIter = std::slice::Iter<'a, MutableDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.sorted.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{OrderBy, OrderDirection};
    use crate::firestore::model::{FieldPath, SnapshotVersion, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, rank: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    #[test]
    fn keeps_query_order_across_updates() {
        let query = Query::collection("rooms")
            .unwrap()
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("rank").unwrap(),
                OrderDirection::Descending,
            ));
        let mut set = DocumentSet::new(&query);
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 3));
        set.insert(doc("rooms/c", 2));
        let order: Vec<String> = set.keys().map(|key| key.to_string()).collect();
        assert_eq!(order, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.insert(doc("rooms/a", 5));
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/a");
        assert_eq!(set.len(), 3);

        set.remove(&DocumentKey::from_string("rooms/b").unwrap());
        assert_eq!(set.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(1));
        assert_eq!(set.last().unwrap().key().to_string(), "rooms/c");
    }
}
