//! Wire messages of `sora.device.v1beta.DeviceService`
//!
//! Declared with `prost` derives so the crate builds without `protoc`. Field
//! tags match the service's `.proto` definitions.

use prost_types::value::Kind;
use prost_types::{Struct, Timestamp, Value};

use crate::types::{StatusMap, StatusValue};

pub const SERVICE_NAME: &str = "sora.device.v1beta.DeviceService";
pub const STREAM_DEVICE_STATE_PATH: &str = "/sora.device.v1beta.DeviceService/StreamDeviceState";
pub const STREAM_EVENT_PATH: &str = "/sora.device.v1beta.DeviceService/StreamEvent";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    #[prost(double, tag = "1")]
    pub lat: f64,
    #[prost(double, tag = "2")]
    pub lon: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Orientation {
    #[prost(double, tag = "1")]
    pub pitch: f64,
    #[prost(double, tag = "2")]
    pub yaw: f64,
    #[prost(double, tag = "3")]
    pub roll: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceState {
    #[prost(string, tag = "1")]
    pub device_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub time: ::core::option::Option<Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub orientation: ::core::option::Option<Orientation>,
    #[prost(message, optional, tag = "4")]
    pub pos: ::core::option::Option<Position>,
    #[prost(message, optional, tag = "5")]
    pub user_data: ::core::option::Option<Struct>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub device_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub time: ::core::option::Option<Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub pos: ::core::option::Option<Position>,
    #[prost(string, tag = "4")]
    pub r#type: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "5")]
    pub payload: ::core::option::Option<Struct>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamDeviceStateRequest {
    #[prost(message, optional, tag = "1")]
    pub state: ::core::option::Option<DeviceState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamDeviceStateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamEventRequest {
    #[prost(message, optional, tag = "1")]
    pub event: ::core::option::Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamEventResponse {}

// ============================================================================
// Conversions
// ============================================================================

/// Wall-clock time as a protobuf timestamp.
pub fn timestamp_now() -> Timestamp {
    let now = chrono::Utc::now();
    Timestamp {
        seconds: now.timestamp(),
        nanos: i32::try_from(now.timestamp_subsec_nanos()).unwrap_or(0),
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_value(value: &StatusValue) -> Value {
    let kind = match value {
        StatusValue::Bool(b) => Kind::BoolValue(*b),
        // Struct only carries doubles
        StatusValue::Int(i) => Kind::NumberValue(*i as f64),
        StatusValue::Float(f) if f.is_finite() => Kind::NumberValue(*f),
        StatusValue::Float(_) => Kind::NullValue(0),
        StatusValue::Text(s) => Kind::StringValue(s.clone()),
    };
    Value { kind: Some(kind) }
}

/// Convert a status / payload map into a `google.protobuf.Struct`.
pub fn to_struct(map: &StatusMap) -> Struct {
    Struct {
        fields: map.iter().map(|(k, v)| (k.clone(), to_value(v))).collect(),
    }
}
