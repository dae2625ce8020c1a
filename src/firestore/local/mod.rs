pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_backfiller;
pub mod index_manager;
pub mod lease;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod lru_reference_delegate;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use index_backfiller::{IndexBackfiller, IndexBackfillerScheduler};
#[doc(inline)]
pub use local_store::{
    LocalStore, LocalStoreConfig, LocalViewChanges, LocalWriteResult, QueryResult,
    UserChangeResult,
};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults, LruScheduler};
#[doc(inline)]
pub use persistence::{MemoryPersistence, PersistenceChange, PersistenceTransactionMode};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
