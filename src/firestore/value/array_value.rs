use crate::firestore::value::{compare_values, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    /// Membership under the query comparator, so `1` matches `1.0`.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values
            .iter()
            .any(|candidate| compare_values(candidate, needle).is_eq())
    }
}
