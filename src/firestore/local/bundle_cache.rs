use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::SnapshotVersion;

/// Metadata of a loaded data bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub bundle_id: String,
    pub create_time: SnapshotVersion,
    pub version: i32,
}

/// Query shipped inside a bundle under a name, with the time its results
/// were read.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

/// Bundles and named queries that were loaded into the cache.
#[derive(Clone, Debug, Default)]
pub struct BundleCache;

impl BundleCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_bundle_metadata(
        &self,
        txn: &PersistenceTransaction,
        bundle_id: &str,
    ) -> Option<BundleMetadata> {
        txn.stores().bundles.get(bundle_id).cloned()
    }

    pub fn save_bundle_metadata(
        &self,
        txn: &mut PersistenceTransaction,
        metadata: BundleMetadata,
    ) -> FirestoreResult<()> {
        txn.stores_mut()?
            .bundles
            .insert(metadata.bundle_id.clone(), metadata);
        Ok(())
    }

    pub fn get_named_query(&self, txn: &PersistenceTransaction, name: &str) -> Option<NamedQuery> {
        txn.stores().named_queries.get(name).cloned()
    }

    /// Stores `query` unless a newer read of the same name is cached.
    pub fn save_named_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: NamedQuery,
    ) -> FirestoreResult<()> {
        let newer_cached = txn
            .stores()
            .named_queries
            .get(&query.name)
            .map(|existing| existing.read_time > query.read_time)
            .unwrap_or(false);
        if !newer_cached {
            txn.stores_mut()?
                .named_queries
                .insert(query.name.clone(), query);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, PersistenceTransactionMode};
    use crate::firestore::model::Timestamp;

    #[tokio::test]
    async fn keeps_newest_named_query() {
        let persistence = MemoryPersistence::new("client");
        let cache = BundleCache::new();
        let named = |seconds: i64, path: &str| NamedQuery {
            name: "latest".to_string(),
            query: Query::collection(path).unwrap(),
            read_time: SnapshotVersion::new(Timestamp::new(seconds, 0)),
        };
        let stored = persistence
            .run_transaction("bundle", PersistenceTransactionMode::ReadWrite, |txn| {
                cache.save_named_query(txn, named(5, "new"))?;
                cache.save_named_query(txn, named(1, "old"))?;
                Ok(cache.get_named_query(txn, "latest"))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.query.path().canonical_string(), "new");
    }
}
