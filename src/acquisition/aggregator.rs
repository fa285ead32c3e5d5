//! Navigation Aggregator: fuses per-epoch messages into a `LocationRecord`
//!
//! The receiver emits position, attitude and time as separate messages that
//! share a GPS time-of-week. The aggregator keeps one pending group keyed by
//! that tow and emits a record as soon as every required kind has arrived.
//! A new tow discards whatever was collected for the old one: a group is
//! either complete or dropped, never partially emitted.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::types::{
    FixMode, GpsTime, LocationRecord, MessageKind, NavMessage, OrientEuler, Orientation, PosLlh,
    Position, StatusMap,
};

/// Orientation values are fixed-point microdegrees.
const MICRODEGREES_PER_DEGREE: f64 = 1_000_000.0;

/// Which message kinds must be present before a record is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub orientation: bool,
    pub gps_time: bool,
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub messages: u64,
    pub ignored: u64,
    pub emitted: u64,
    /// Groups discarded because the tow advanced before they completed.
    pub dropped_groups: u64,
}

pub struct NavigationAggregator {
    required: BTreeSet<MessageKind>,
    pending: BTreeMap<MessageKind, NavMessage>,
    current_tow: Option<u32>,
    stats: AggregatorStats,
}

impl NavigationAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let mut required = BTreeSet::from([MessageKind::Position]);
        if config.orientation {
            required.insert(MessageKind::Orientation);
        }
        if config.gps_time {
            required.insert(MessageKind::GpsTime);
        }
        Self {
            required,
            pending: BTreeMap::new(),
            current_tow: None,
            stats: AggregatorStats::default(),
        }
    }

    pub fn required(&self) -> &BTreeSet<MessageKind> {
        &self.required
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Feed one message; returns a record when it completes the group.
    pub fn push(&mut self, msg: NavMessage) -> Option<LocationRecord> {
        self.stats.messages += 1;

        let kind = msg.kind();
        if !self.required.contains(&kind) {
            self.stats.ignored += 1;
            trace!(%kind, "Ignoring message kind outside required set");
            return None;
        }

        let tow = msg.tow();
        if self.current_tow != Some(tow) {
            if !self.pending.is_empty() {
                self.stats.dropped_groups += 1;
                debug!(
                    old_tow = ?self.current_tow,
                    new_tow = tow,
                    collected = self.pending.len(),
                    "Discarding incomplete message group"
                );
                self.pending.clear();
            }
            self.current_tow = Some(tow);
        }

        self.pending.insert(kind, msg);
        if !self.required.iter().all(|k| self.pending.contains_key(k)) {
            return None;
        }

        let group = std::mem::take(&mut self.pending);
        let record = fuse(&group)?;
        self.stats.emitted += 1;
        Some(record)
    }
}

/// Decode a complete group into a record.
fn fuse(group: &BTreeMap<MessageKind, NavMessage>) -> Option<LocationRecord> {
    let Some(NavMessage::PosLlh(pos)) = group.get(&MessageKind::Position) else {
        return None;
    };

    let mut status = position_status(pos);
    let orientation = match group.get(&MessageKind::Orientation) {
        Some(NavMessage::OrientEuler(orient)) => orientation_fields(orient, &mut status),
        _ => None,
    };
    if let Some(NavMessage::GpsTime(time)) = group.get(&MessageKind::GpsTime) {
        gps_time_fields(time, &mut status);
    }

    Some(LocationRecord {
        position: Position {
            lat: pos.lat,
            lon: pos.lon,
            height: Some(pos.height),
        },
        orientation,
        status,
    })
}

fn position_status(pos: &PosLlh) -> StatusMap {
    let mut status = StatusMap::new();
    status.insert("n_sats".into(), pos.n_sats.into());
    status.insert("h_accuracy".into(), pos.h_accuracy.into());
    status.insert("v_accuracy".into(), pos.v_accuracy.into());
    status.insert("flags".into(), pos.flags.into());
    status.insert("fix_mode".into(), FixMode::from_flags(pos.flags).as_str().into());
    // Also the natural dedup key for redelivered records.
    status.insert("tow".into(), pos.tow.into());
    status
}

/// Attitude is only reported when the INS navigation mode is valid.
fn orientation_fields(orient: &OrientEuler, status: &mut StatusMap) -> Option<Orientation> {
    if orient.flags & 0x7 == 0 {
        return None;
    }

    status.insert("roll_accuracy".into(), orient.roll_accuracy.into());
    status.insert("pitch_accuracy".into(), orient.pitch_accuracy.into());
    status.insert("yaw_accuracy".into(), orient.yaw_accuracy.into());
    status.insert("orientation_flags".into(), orient.flags.into());

    Some(Orientation {
        yaw: f64::from(orient.yaw) / MICRODEGREES_PER_DEGREE,
        pitch: f64::from(orient.pitch) / MICRODEGREES_PER_DEGREE,
        roll: f64::from(orient.roll) / MICRODEGREES_PER_DEGREE,
    })
}

fn gps_time_fields(time: &GpsTime, status: &mut StatusMap) {
    status.insert("gps_week".into(), time.wn.into());
}
