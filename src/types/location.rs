//! Fused location records and the free-form status map they carry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::nav::FixMode;

/// Status / payload map: ordered, type-erased telemetry.
pub type StatusMap = BTreeMap<String, StatusValue>;

/// Scalar value of a status or event payload entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StatusValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for StatusValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for StatusValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for StatusValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for StatusValue {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u8> for StatusValue {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for StatusValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for StatusValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<&str> for StatusValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for StatusValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Geodetic position in degrees / metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub height: Option<f64>,
}

/// Attitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

/// One fused epoch: position, optional attitude and auxiliary status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub position: Position,
    pub orientation: Option<Orientation>,
    pub status: StatusMap,
}

impl LocationRecord {
    /// Fix mode reported in the status map, `Unknown` if absent.
    pub fn fix_mode(&self) -> FixMode {
        self.status
            .get("fix_mode")
            .and_then(StatusValue::as_str)
            .and_then(FixMode::from_name)
            .unwrap_or(FixMode::Unknown)
    }
}
