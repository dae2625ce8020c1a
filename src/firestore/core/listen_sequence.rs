use std::sync::atomic::{AtomicI64, Ordering};

use crate::firestore::core::types::ListenSequenceNumber;

/// Monotonic source of listen sequence numbers for one storage.
#[derive(Debug, Default)]
pub struct ListenSequence {
    previous: AtomicI64,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self {
            previous: AtomicI64::new(previous),
        }
    }

    pub fn next(&self) -> ListenSequenceNumber {
        self.previous.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous.load(Ordering::SeqCst)
    }

    /// Moves the sequence past `observed`, e.g. after another client wrote.
    pub fn observe(&self, observed: ListenSequenceNumber) {
        self.previous.fetch_max(observed, Ordering::SeqCst);
    }
}
