//! Persistent storage
//!
//! - `queue`: sled-backed durable outbound queues (one per stream kind)
//! - `lockfile`: single-instance guard for the data directory

pub mod lockfile;
pub mod queue;

pub use lockfile::ProcessLock;
pub use queue::{DurableQueue, Overflow, QueueError, QueueItem, QueueOptions, QueueStats};
