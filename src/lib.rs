//! nav-uplink: navigation telemetry uplink agent
//!
//! Reads GNSS/INS messages from a receiver, fuses them into location records
//! and streams them to a remote device service without losing data across
//! network outages or restarts.
//!
//! ## Architecture
//!
//! - **Acquisition**: receiver drivers, SBP decoding, `NavigationAggregator`
//! - **Pipeline**: ingest loop with decimation and fix-quality filtering
//! - **Storage**: `DurableQueue` (sled) and the data directory lock
//! - **Uplink**: `DeviceClient` and one `UplinkSession` per outbound stream

pub mod acquisition;
pub mod config;
pub mod identity;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod uplink;

pub use acquisition::{AggregatorConfig, MessageSource, NavigationAggregator};
pub use config::{AgentConfig, ConfigError};
pub use identity::{DeviceIdentity, IdentityError};
pub use pipeline::{IngestLoop, IngestStats};
pub use storage::{DurableQueue, Overflow, QueueError, QueueItem, QueueOptions, QueueStats};
pub use types::{FixMode, LocationRecord, NavMessage, Orientation, Position, StatusMap, StatusValue};
pub use uplink::{DeviceClient, GrpcUplink, SessionState, StreamKind, Uplink, UplinkSession};
