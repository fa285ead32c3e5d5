//! Device Client: enqueue API plus lifecycle of both uplink sessions

use prost::Message;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::proto::{self, to_struct, timestamp_now};
use super::session::{SessionConfig, SessionState, SessionStats, UplinkSession};
use super::transport::{StreamKind, Uplink};
use crate::config::AgentConfig;
use crate::identity::DeviceIdentity;
use crate::storage::{DurableQueue, QueueError, QueueStats};
use crate::types::{LocationRecord, StatusMap, StatusValue};

/// Session tuning for both streams.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub state: SessionConfig,
    pub event: SessionConfig,
    pub connect_timeout: Duration,
}

impl ClientSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let uplink = &config.uplink;
        let session = |window| SessionConfig {
            window,
            batch_wait: uplink.batch_wait(),
            retry_backoff: uplink.retry_backoff(),
            retain_acked: config.queue.retain_acked,
        };
        Self {
            state: session(uplink.state_window),
            event: session(uplink.event_window),
            connect_timeout: uplink.connect_timeout(),
        }
    }
}

struct RunningSession {
    kind: StreamKind,
    handle: JoinHandle<Result<SessionStats, QueueError>>,
    state: watch::Receiver<SessionState>,
}

pub struct DeviceClient {
    identity: Arc<DeviceIdentity>,
    state_queue: Arc<DurableQueue>,
    event_queue: Arc<DurableQueue>,
    uplink: Arc<dyn Uplink>,
    settings: ClientSettings,
    stop: CancellationToken,
    sessions: Mutex<Vec<RunningSession>>,
}

impl DeviceClient {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        state_queue: Arc<DurableQueue>,
        event_queue: Arc<DurableQueue>,
        uplink: Arc<dyn Uplink>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            identity,
            state_queue,
            event_queue,
            uplink,
            settings,
            stop: CancellationToken::new(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn queue(&self, kind: StreamKind) -> &Arc<DurableQueue> {
        match kind {
            StreamKind::State => &self.state_queue,
            StreamKind::Event => &self.event_queue,
        }
    }

    /// Ready / Unacked / Acked counts of (state, event) queues.
    pub fn backlog(&self) -> (QueueStats, QueueStats) {
        (self.state_queue.stats(), self.event_queue.stats())
    }

    /// Current state of each running session.
    pub fn session_states(&self) -> Vec<(StreamKind, SessionState)> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.kind, *s.state.borrow()))
            .collect()
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Queue a state update built from a free-form status map.
    ///
    /// Without INS attitude the heading is derived from a `bearing` status
    /// entry when one is present.
    pub async fn send_state(&self, status: &StatusMap, lat: f64, lon: f64) -> Result<u64, QueueError> {
        self.enqueue_state(status, lat, lon, bearing_orientation(status)).await
    }

    /// Queue a fused location record as a state update.
    pub async fn send_location(&self, record: &LocationRecord) -> Result<u64, QueueError> {
        let orientation = record.orientation.map_or_else(
            || bearing_orientation(&record.status),
            |o| proto::Orientation {
                pitch: o.pitch,
                yaw: o.yaw,
                roll: o.roll,
            },
        );
        self.enqueue_state(
            &record.status,
            record.position.lat,
            record.position.lon,
            orientation,
        )
        .await
    }

    async fn enqueue_state(
        &self,
        status: &StatusMap,
        lat: f64,
        lon: f64,
        orientation: proto::Orientation,
    ) -> Result<u64, QueueError> {
        let request = proto::StreamDeviceStateRequest {
            state: Some(proto::DeviceState {
                device_id: self.identity.device_id.to_string(),
                time: Some(timestamp_now()),
                orientation: Some(orientation),
                pos: Some(proto::Position { lat, lon }),
                user_data: Some(to_struct(status)),
            }),
        };

        let id = self.state_queue.put(&request.encode_to_vec()).await?;
        debug!(id, lat, lon, "Queued state update");
        Ok(id)
    }

    /// Queue a discrete event.
    pub async fn add_event(
        &self,
        event_type: &str,
        payload: &StatusMap,
        lat: Option<f64>,
        lon: Option<f64>,
    ) -> Result<u64, QueueError> {
        let pos = match (lat, lon) {
            (Some(lat), Some(lon)) => Some(proto::Position { lat, lon }),
            _ => None,
        };
        let request = proto::StreamEventRequest {
            event: Some(proto::Event {
                device_id: self.identity.device_id.to_string(),
                time: Some(timestamp_now()),
                pos,
                r#type: event_type.to_string(),
                payload: Some(to_struct(payload)),
            }),
        };

        let id = self.event_queue.put(&request.encode_to_vec()).await?;
        info!(id, event_type, "Queued event");
        Ok(id)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Check connectivity and spawn both uplink sessions.
    ///
    /// An unreachable server is not an error: sessions keep retrying and
    /// records stay queued. A session storage failure cancels `supervisor`.
    pub async fn start(&self, supervisor: &CancellationToken) {
        let already_started = !self.sessions.lock().unwrap_or_else(PoisonError::into_inner).is_empty();
        if already_started {
            warn!("Device client already started");
            return;
        }

        info!(
            device_id = %self.identity.device_id,
            device_name = self.identity.device_name.as_deref().unwrap_or("-"),
            "Starting device client"
        );
        if let Err(e) = self.uplink.connect().await {
            warn!(error = %e, "Device service not reachable yet, records will be queued");
        }

        let mut running = Vec::with_capacity(2);
        for (kind, config) in [
            (StreamKind::State, self.settings.state),
            (StreamKind::Event, self.settings.event),
        ] {
            let session = UplinkSession::new(
                kind,
                Arc::clone(self.queue(kind)),
                Arc::clone(&self.uplink),
                config,
                self.stop.clone(),
            );
            let state = session.subscribe();
            let supervisor = supervisor.clone();
            let handle = tokio::spawn(async move {
                let result = session.run().await;
                if result.is_err() {
                    supervisor.cancel();
                }
                result
            });
            running.push(RunningSession { kind, handle, state });
        }

        *self.sessions.lock().unwrap_or_else(PoisonError::into_inner) = running;
    }

    /// Stop both sessions, waiting at most `timeout` in total.
    ///
    /// Sessions are joined in turn, each getting an equal share of whatever
    /// budget remains. A session that overruns is aborted; its entries stay
    /// queued for the next start. Returns the first storage failure reported
    /// by a session.
    pub async fn stop(&self, timeout: Duration) -> Result<(), QueueError> {
        self.stop.cancel();

        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap_or_else(PoisonError::into_inner));
        let deadline = Instant::now() + timeout;
        let total = sessions.len();
        let mut first_error = None;

        for (joined, mut session) in sessions.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let share = remaining / u32::try_from(total - joined).unwrap_or(1);

            match tokio::time::timeout(share, &mut session.handle).await {
                Ok(Ok(Ok(stats))) => {
                    debug!(stream = %session.kind, delivered = stats.delivered, "Session joined");
                }
                Ok(Ok(Err(e))) => {
                    error!(stream = %session.kind, error = %e, "Session ended with storage failure");
                    first_error.get_or_insert(e);
                }
                Ok(Err(e)) => {
                    error!(stream = %session.kind, error = %e, "Session task panicked");
                }
                Err(_) => {
                    session.handle.abort();
                    let stats = self.queue(session.kind).stats();
                    warn!(
                        stream = %session.kind,
                        ready = stats.ready,
                        unacked = stats.unacked,
                        "Session did not stop in time; entries stay queued for next start"
                    );
                }
            }
        }

        let (state, event) = self.backlog();
        if state.pending() + event.pending() > 0 {
            info!(
                state_pending = state.pending(),
                event_pending = event.pending(),
                "Undelivered entries remain queued"
            );
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Heading derived from a `bearing` status entry (pitch 0, roll 90).
fn bearing_orientation(status: &StatusMap) -> proto::Orientation {
    let bearing = status.get("bearing").and_then(StatusValue::as_f64).unwrap_or(0.0);
    proto::Orientation {
        pitch: 0.0,
        yaw: 180.0 - bearing,
        roll: 90.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::token_with_claims;
    use crate::storage::QueueOptions;
    use crate::types::{Orientation, Position};
    use crate::uplink::transport::{PayloadStream, TransportError};
    use async_trait::async_trait;
    use futures::StreamExt;

    /// Connect always fails; streams never complete.
    struct HangingUplink;

    #[async_trait]
    impl Uplink for HangingUplink {
        async fn connect(&self) -> Result<(), TransportError> {
            Err(TransportError::ConnectTimeout(Duration::from_millis(1)))
        }

        async fn stream(&self, _kind: StreamKind, mut items: PayloadStream) -> Result<(), TransportError> {
            let _first = items.next().await;
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn identity() -> Arc<DeviceIdentity> {
        let token = token_with_claims(&serde_json::json!({
            "device_id": "5b1f7a4e-0c1d-4c53-9a4e-7d0f2b8e6c11",
            "sub": "0f8e2c1a-2b3d-4e5f-8a9b-1c2d3e4f5a6b",
        }));
        Arc::new(DeviceIdentity::from_access_token(&token).unwrap())
    }

    fn settings() -> ClientSettings {
        let session = SessionConfig {
            window: 10,
            batch_wait: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(20),
            retain_acked: 10,
        };
        ClientSettings {
            state: session,
            event: session,
            connect_timeout: Duration::from_millis(50),
        }
    }

    fn client(dir: &std::path::Path, uplink: Arc<dyn Uplink>) -> DeviceClient {
        let open = |name: &str| Arc::new(DurableQueue::open(dir.join(name), QueueOptions::default()).unwrap());
        DeviceClient::new(identity(), open("state"), open("event"), uplink, settings())
    }

    async fn decode_state(queue: &DurableQueue) -> proto::DeviceState {
        let batch = queue.get_batch(1, Duration::from_millis(10)).await.unwrap();
        proto::StreamDeviceStateRequest::decode(batch[0].payload.as_slice())
            .unwrap()
            .state
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_location_encodes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path(), Arc::new(HangingUplink));

        let mut status = StatusMap::new();
        status.insert("fix_mode".into(), "Fixed RTK".into());
        let record = LocationRecord {
            position: Position { lat: 10.5, lon: 20.25, height: Some(3.0) },
            orientation: Some(Orientation { yaw: 45.0, pitch: 1.0, roll: -2.0 }),
            status,
        };
        client.send_location(&record).await.unwrap();

        let state = decode_state(&client.state_queue).await;
        assert_eq!(state.device_id, "5b1f7a4e-0c1d-4c53-9a4e-7d0f2b8e6c11");
        assert_eq!(state.pos, Some(proto::Position { lat: 10.5, lon: 20.25 }));
        assert_eq!(state.orientation, Some(proto::Orientation { pitch: 1.0, yaw: 45.0, roll: -2.0 }));
        assert!(state.time.is_some());
        assert!(state.user_data.unwrap().fields.contains_key("fix_mode"));
    }

    #[tokio::test]
    async fn test_send_state_uses_bearing() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path(), Arc::new(HangingUplink));

        let mut status = StatusMap::new();
        status.insert("bearing".into(), 30.0f64.into());
        client.send_state(&status, 1.0, 2.0).await.unwrap();

        let state = decode_state(&client.state_queue).await;
        assert_eq!(state.orientation, Some(proto::Orientation { pitch: 0.0, yaw: 150.0, roll: 90.0 }));
    }

    #[tokio::test]
    async fn test_add_event_without_position() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path(), Arc::new(HangingUplink));

        let mut payload = StatusMap::new();
        payload.insert("from".into(), "SPP".into());
        client.add_event("fix_mode_changed", &payload, None, None).await.unwrap();

        let batch = client.event_queue.get_batch(1, Duration::from_millis(10)).await.unwrap();
        let event = proto::StreamEventRequest::decode(batch[0].payload.as_slice())
            .unwrap()
            .event
            .unwrap();
        assert_eq!(event.r#type, "fix_mode_changed");
        assert!(event.pos.is_none());
    }

    #[tokio::test]
    async fn test_stop_times_out_and_keeps_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let client = client(tmp.path(), Arc::new(HangingUplink));
        client.send_state(&StatusMap::new(), 0.0, 0.0).await.unwrap();

        let supervisor = CancellationToken::new();
        client.start(&supervisor).await;

        // Let the state session pick the entry up and hang in the call
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client
            .session_states()
            .contains(&(StreamKind::State, SessionState::Streaming)));

        let started = std::time::Instant::now();
        client.stop(Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!supervisor.is_cancelled());

        let (state, _) = client.backlog();
        assert_eq!(state.pending(), 1);
        assert_eq!(state.acked, 0);
    }
}
