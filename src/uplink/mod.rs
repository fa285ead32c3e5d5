//! Reliable uplink to the remote device service
//!
//! - `proto`: wire messages of the device service
//! - `transport`: the `Uplink` seam and its gRPC implementation
//! - `session`: drains one durable queue into one outbound stream
//! - `client`: `DeviceClient`, the enqueue API and session lifecycle

pub mod client;
pub mod proto;
pub mod session;
pub mod transport;

pub use client::{ClientSettings, DeviceClient};
pub use session::{SessionConfig, SessionState, SessionStats, UplinkSession};
pub use transport::{GrpcUplink, PayloadStream, StreamKind, TransportError, Uplink};
