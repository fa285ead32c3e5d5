//! Receiver data acquisition
//!
//! - `sbp`: SBP binary framing, payload and SBP-JSON decoding
//! - `source`: drivers (TCP, file/serial, stdin) and the `MessageSource` union
//! - `aggregator`: fuses per-epoch messages into `LocationRecord`s

pub mod aggregator;
pub mod sbp;
pub mod source;

pub use aggregator::{AggregatorConfig, AggregatorStats, NavigationAggregator};
pub use sbp::{ProtocolError, SbpCodec, SbpFrame};
pub use source::{DriverStream, MessageSource, SourceError};
