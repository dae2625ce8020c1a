pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use self::core::{FirestoreClient, FirestoreClientComponents, FirestoreClientSettings, ListenOptions};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
