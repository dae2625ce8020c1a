/// Identifier of a listen target, shared by the local store and the watch
/// stream.
pub type TargetId = i32;

/// Position on the listen sequence used to order targets and documents for
/// garbage collection.
pub type ListenSequenceNumber = i64;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Whether the client believes it can currently reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Connection state is not known yet. Listeners keep waiting for the
    /// server before raising events.
    Unknown,
    Online,
    /// Listeners raise events from cache.
    Offline,
}

