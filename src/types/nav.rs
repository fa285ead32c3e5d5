//! Decoded navigation messages
//!
//! The receiver reports each epoch as several independent messages that share
//! a GPS time-of-week (`tow`, milliseconds). Only the three kinds the agent
//! fuses are modelled; everything else is dropped by the decoders.

use serde::{Deserialize, Serialize};

/// SBP message type of `MSG_GPS_TIME`.
pub const MSG_GPS_TIME: u16 = 0x0102;
/// SBP message type of `MSG_POS_LLH`.
pub const MSG_POS_LLH: u16 = 0x020A;
/// SBP message type of `MSG_ORIENT_EULER`.
pub const MSG_ORIENT_EULER: u16 = 0x0221;

/// Kind tag used to correlate messages into a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    GpsTime,
    Position,
    Orientation,
}

impl MessageKind {
    /// Map an SBP message type onto a kind, `None` for types we don't fuse.
    pub fn from_msg_type(msg_type: u16) -> Option<Self> {
        match msg_type {
            MSG_GPS_TIME => Some(Self::GpsTime),
            MSG_POS_LLH => Some(Self::Position),
            MSG_ORIENT_EULER => Some(Self::Orientation),
            _ => None,
        }
    }

    pub fn msg_type(self) -> u16 {
        match self {
            Self::GpsTime => MSG_GPS_TIME,
            Self::Position => MSG_POS_LLH,
            Self::Orientation => MSG_ORIENT_EULER,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GpsTime => write!(f, "gps_time"),
            Self::Position => write!(f, "position"),
            Self::Orientation => write!(f, "orientation"),
        }
    }
}

/// `MSG_GPS_TIME`: GPS week number and time-of-week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsTime {
    pub wn: u16,
    pub tow: u32,
    #[serde(default)]
    pub ns_residual: i32,
    pub flags: u8,
}

/// `MSG_POS_LLH`: geodetic position solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosLlh {
    pub tow: u32,
    /// Degrees
    pub lat: f64,
    /// Degrees
    pub lon: f64,
    /// Metres above WGS84 ellipsoid
    pub height: f64,
    /// Millimetres
    pub h_accuracy: u16,
    /// Millimetres
    pub v_accuracy: u16,
    pub n_sats: u8,
    /// Low three bits carry the fix mode.
    pub flags: u8,
}

/// `MSG_ORIENT_EULER`: vehicle attitude in fixed-point microdegrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientEuler {
    pub tow: u32,
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
    pub roll_accuracy: f32,
    pub pitch_accuracy: f32,
    pub yaw_accuracy: f32,
    /// Low three bits carry the INS navigation mode; zero means invalid.
    pub flags: u8,
}

/// A single decoded navigation message.
#[derive(Debug, Clone, PartialEq)]
pub enum NavMessage {
    GpsTime(GpsTime),
    PosLlh(PosLlh),
    OrientEuler(OrientEuler),
}

impl NavMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::GpsTime(_) => MessageKind::GpsTime,
            Self::PosLlh(_) => MessageKind::Position,
            Self::OrientEuler(_) => MessageKind::Orientation,
        }
    }

    /// Correlation key shared by every message of one epoch.
    pub fn tow(&self) -> u32 {
        match self {
            Self::GpsTime(m) => m.tow,
            Self::PosLlh(m) => m.tow,
            Self::OrientEuler(m) => m.tow,
        }
    }
}

// ============================================================================
// Fix Mode
// ============================================================================

/// Quality classification of a position solution (`flags & 0x7`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixMode {
    Invalid,
    Spp,
    Dgnss,
    FloatRtk,
    FixedRtk,
    DeadReckoning,
    Sbas,
    /// Reserved value 7.
    Unknown,
}

impl FixMode {
    const TABLE: [FixMode; 7] = [
        FixMode::Invalid,
        FixMode::Spp,
        FixMode::Dgnss,
        FixMode::FloatRtk,
        FixMode::FixedRtk,
        FixMode::DeadReckoning,
        FixMode::Sbas,
    ];

    pub fn from_flags(flags: u8) -> Self {
        Self::TABLE
            .get(usize::from(flags & 0x7))
            .copied()
            .unwrap_or(FixMode::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid",
            Self::Spp => "SPP",
            Self::Dgnss => "DGNSS",
            Self::FloatRtk => "Float RTK",
            Self::FixedRtk => "Fixed RTK",
            Self::DeadReckoning => "Dead Reckoning",
            Self::Sbas => "SBAS",
            Self::Unknown => "Unknown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .chain(std::iter::once(&FixMode::Unknown))
            .copied()
            .find(|mode| mode.as_str() == name)
    }

    /// Whether the solution is usable for reporting.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Invalid | Self::Unknown)
    }
}

impl std::fmt::Display for FixMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
