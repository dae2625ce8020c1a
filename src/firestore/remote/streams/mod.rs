pub mod listen;
pub mod write;

pub use listen::{ListenStream, WatchStreamListener};
pub use write::{WriteStream, WriteStreamListener};
