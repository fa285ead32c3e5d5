//! End-to-end delivery tests: receiver bytes -> queues -> mock device service
//!
//! The mock uplink decodes every request it receives so the tests can check
//! ordering and at-least-once delivery across a simulated crash.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use prost::Message;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use nav_uplink::acquisition::{sbp, AggregatorConfig, MessageSource, NavigationAggregator};
use nav_uplink::config::{DriverConfig, LocationConfig, SourceFormat};
use nav_uplink::identity::DeviceIdentity;
use nav_uplink::pipeline::IngestLoop;
use nav_uplink::storage::{DurableQueue, QueueOptions};
use nav_uplink::types::{NavMessage, OrientEuler, PosLlh};
use nav_uplink::uplink::proto::StreamDeviceStateRequest;
use nav_uplink::uplink::{
    ClientSettings, DeviceClient, PayloadStream, SessionConfig, StreamKind, TransportError, Uplink,
    UplinkSession,
};

const DEVICE_ID: &str = "3f6c1e2d-9a8b-4c7d-b6e5-f4a3b2c1d0e9";

fn identity() -> Arc<DeviceIdentity> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let claims = serde_json::json!({
        "device_id": DEVICE_ID,
        "sub": "a1b2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d",
        "device_name": "rover-7",
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    Arc::new(DeviceIdentity::from_access_token(&format!("{header}.{payload}.sig")).unwrap())
}

/// Stores the `tow` of every state it receives; optionally fails whole calls.
#[derive(Default)]
struct MockDeviceService {
    tows: Mutex<Vec<i64>>,
    calls: AtomicUsize,
    fail_first_calls: usize,
}

impl MockDeviceService {
    fn tows(&self) -> Vec<i64> {
        self.tows.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uplink for MockDeviceService {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stream(&self, kind: StreamKind, mut items: PayloadStream) -> Result<(), TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut received = Vec::new();
        while let Some(payload) = items.next().await {
            if kind == StreamKind::State {
                let state = StreamDeviceStateRequest::decode(payload.as_slice())
                    .unwrap()
                    .state
                    .unwrap();
                assert_eq!(state.device_id, DEVICE_ID);
                let user_data = state.user_data.unwrap();
                match user_data.fields["tow"].kind {
                    Some(prost_types::value::Kind::NumberValue(n)) => received.push(n as i64),
                    ref other => panic!("tow is not a number: {other:?}"),
                }
            }
        }
        if call < self.fail_first_calls {
            return Err(TransportError::Status(tonic::Status::unavailable("restarting")));
        }
        self.tows.lock().unwrap().extend(received);
        Ok(())
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        window: 4,
        batch_wait: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(20),
        retain_acked: 3,
    }
}

fn open_queue(path: &Path) -> Arc<DurableQueue> {
    Arc::new(DurableQueue::open(path, QueueOptions::default()).unwrap())
}

async fn wait_for_drain(queue: &DurableQueue) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.stats().pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained");
}

fn position(tow: u32) -> NavMessage {
    NavMessage::PosLlh(PosLlh {
        tow,
        lat: 48.85,
        lon: 2.35,
        height: 35.0,
        h_accuracy: 20,
        v_accuracy: 40,
        n_sats: 14,
        flags: 4,
    })
}

fn attitude(tow: u32) -> NavMessage {
    NavMessage::OrientEuler(OrientEuler {
        tow,
        roll: 0,
        pitch: 0,
        yaw: 45_000_000,
        roll_accuracy: 0.2,
        pitch_accuracy: 0.2,
        yaw_accuracy: 0.4,
        flags: 2,
    })
}

#[tokio::test]
async fn unacked_batch_survives_crash_and_is_redelivered_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("state");

    {
        let queue = open_queue(&path);
        for tow in 0..6u32 {
            let mut status = nav_uplink::types::StatusMap::new();
            status.insert("tow".into(), tow.into());
            let request = StreamDeviceStateRequest {
                state: Some(nav_uplink::uplink::proto::DeviceState {
                    device_id: DEVICE_ID.into(),
                    user_data: Some(nav_uplink::uplink::proto::to_struct(&status)),
                    ..Default::default()
                }),
            };
            queue.put(&request.encode_to_vec()).await.unwrap();
        }

        // A batch is in flight when the process dies
        let in_flight = queue.get_batch(4, Duration::ZERO).await.unwrap();
        assert_eq!(in_flight.len(), 4);
        assert_eq!(queue.stats().unacked, 4);
    }

    let queue = open_queue(&path);
    assert_eq!(queue.stats().pending(), 6);

    let service = Arc::new(MockDeviceService {
        fail_first_calls: 1,
        ..Default::default()
    });
    let stop = CancellationToken::new();
    let session = UplinkSession::new(
        StreamKind::State,
        Arc::clone(&queue),
        Arc::clone(&service) as Arc<dyn Uplink>,
        session_config(),
        stop.clone(),
    );
    let task = tokio::spawn(session.run());

    wait_for_drain(&queue).await;
    stop.cancel();
    let stats = task.await.unwrap().unwrap();

    assert_eq!(service.tows(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(stats.failures, 1);
    // Trimmed down to the retained tail
    assert_eq!(queue.acked_ids().unwrap().len(), 3);
}

#[tokio::test]
async fn receiver_capture_reaches_device_service() {
    let tmp = tempfile::tempdir().unwrap();

    let capture = tmp.path().join("capture.sbp");
    let mut bytes = Vec::new();
    for tow in [1000u32, 1200, 1400, 1600] {
        bytes.extend_from_slice(&sbp::encode_message(&position(tow), 0x42).unwrap());
        bytes.extend_from_slice(&sbp::encode_message(&attitude(tow), 0x42).unwrap());
    }
    std::fs::write(&capture, bytes).unwrap();

    let service = Arc::new(MockDeviceService::default());
    let client = Arc::new(DeviceClient::new(
        identity(),
        open_queue(&tmp.path().join("queues/state")),
        open_queue(&tmp.path().join("queues/event")),
        Arc::clone(&service) as Arc<dyn Uplink>,
        ClientSettings {
            state: session_config(),
            event: session_config(),
            connect_timeout: Duration::from_millis(100),
        },
    ));

    let supervisor = CancellationToken::new();
    client.start(&supervisor).await;

    let location = LocationConfig {
        orientation: true,
        decimate: 1,
        driver: Some(DriverConfig::File { path: capture }),
        format: SourceFormat::Sbp,
        ..LocationConfig::default()
    };
    let mut source = MessageSource::open(location.driver.as_ref().unwrap(), location.format)
        .await
        .unwrap();
    let aggregator = NavigationAggregator::new(AggregatorConfig {
        orientation: true,
        gps_time: false,
    });
    let stats = IngestLoop::new(aggregator, Arc::clone(&client), &location, supervisor.clone())
        .run(&mut source)
        .await
        .unwrap();
    assert_eq!(stats.forwarded, 4);

    tokio::time::timeout(Duration::from_secs(10), async {
        while service.tows().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all records delivered");

    client.stop(Duration::from_secs(2)).await.unwrap();
    assert_eq!(service.tows(), vec![1000, 1200, 1400, 1600]);
    assert_eq!(client.backlog().0.pending(), 0);
    assert!(!supervisor.is_cancelled());
}
