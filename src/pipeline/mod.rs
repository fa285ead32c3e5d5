//! Ingest pipeline
//!
//! ```text
//! MessageSource ──> NavigationAggregator ──> decimation ──> fix filter ──> DeviceClient
//!                                                               │
//!                                                               └──> fix_mode_changed event
//! ```

pub mod ingest;

pub use ingest::{IngestError, IngestLoop, IngestStats};
