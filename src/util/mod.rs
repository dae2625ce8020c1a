pub mod async_queue;
pub mod backoff;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::{BackoffConfig, ExponentialBackoff, RANDOM_FACTOR};
