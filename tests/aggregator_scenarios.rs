//! Navigation aggregator scenarios through the public API

use nav_uplink::acquisition::{AggregatorConfig, NavigationAggregator};
use nav_uplink::types::{GpsTime, NavMessage, OrientEuler, PosLlh, StatusValue};

fn position(tow: u32) -> NavMessage {
    NavMessage::PosLlh(PosLlh {
        tow,
        lat: 59.91,
        lon: 10.75,
        height: 23.5,
        h_accuracy: 12,
        v_accuracy: 30,
        n_sats: 17,
        flags: 4,
    })
}

fn orientation(tow: u32) -> NavMessage {
    NavMessage::OrientEuler(OrientEuler {
        tow,
        roll: 1_500_000,
        pitch: -250_000,
        yaw: 90_000_000,
        roll_accuracy: 0.5,
        pitch_accuracy: 0.5,
        yaw_accuracy: 1.0,
        flags: 1,
    })
}

fn with_orientation() -> NavigationAggregator {
    NavigationAggregator::new(AggregatorConfig {
        orientation: true,
        gps_time: false,
    })
}

#[test]
fn complete_group_emits_one_record() {
    let mut agg = with_orientation();

    assert!(agg.push(position(5)).is_none());
    let record = agg.push(orientation(5)).expect("group for tow 5 is complete");
    assert!(agg.push(position(6)).is_none());

    assert_eq!(record.position.lat, 59.91);
    let orient = record.orientation.expect("orientation fused");
    assert_eq!(orient.yaw, 90.0);
    assert_eq!(orient.roll, 1.5);
    assert_eq!(orient.pitch, -0.25);
    assert_eq!(record.status["tow"], StatusValue::Int(5));
    assert_eq!(agg.stats().emitted, 1);
}

#[test]
fn incomplete_group_is_discarded_on_new_tow() {
    let mut agg = with_orientation();

    assert!(agg.push(position(5)).is_none());
    assert!(agg.push(position(6)).is_none());

    let stats = agg.stats();
    assert_eq!(stats.emitted, 0);
    assert_eq!(stats.dropped_groups, 1);

    // A late orientation for tow 5 starts a fresh group and never completes it
    assert!(agg.push(orientation(5)).is_none());
    assert_eq!(agg.stats().emitted, 0);
}

#[test]
fn gps_time_adds_week_when_required() {
    let mut agg = NavigationAggregator::new(AggregatorConfig {
        orientation: false,
        gps_time: true,
    });

    assert!(agg.push(position(900)).is_none());
    let record = agg
        .push(NavMessage::GpsTime(GpsTime {
            wn: 2301,
            tow: 900,
            ns_residual: 0,
            flags: 1,
        }))
        .expect("position and time complete the group");

    assert_eq!(record.status["gps_week"], StatusValue::Int(2301));
    assert!(record.orientation.is_none());
}
