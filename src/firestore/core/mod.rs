pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod listen_sequence;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod types;
pub mod view;

#[doc(inline)]
pub use document_set::DocumentSet;
#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, QueryListener, SnapshotCallback};
#[doc(inline)]
pub use firestore_client::{
    FirestoreClient, FirestoreClientComponents, FirestoreClientSettings, ListenerRegistration,
};
#[doc(inline)]
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query, Target};
#[doc(inline)]
pub use sync_engine::{LimboState, SyncEngine, SyncEngineListener, SyncEngineSettings, WriteCompletion};
#[doc(inline)]
pub use types::{OnlineState, TargetId};
#[doc(inline)]
pub use view::{ChangeType, DocumentViewChange, SyncState, View, ViewSnapshot};
