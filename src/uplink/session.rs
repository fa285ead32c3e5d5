//! Uplink Session: drains one durable queue into one outbound stream
//!
//! ```text
//!            ┌──────────── success (no delay) ─────────────┐
//!            v                                             │
//!   Disconnected ── resume_unacked, get_batch ──> Streaming
//!            ^                                             │
//!            └────── failure (log, backoff, resume) ───────┘
//!   stop token cancelled ──> Stopped
//! ```
//!
//! Each non-empty batch is one client-streaming call. Items are fed lazily and
//! the stop token is checked between items; an in-flight call is never
//! interrupted. Entries are acked only after the server has acknowledged the
//! whole stream, so a failure leaves the batch Unacked for redelivery
//! (at-least-once).

use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{StreamKind, TransportError, Uplink};
use crate::storage::{DurableQueue, QueueError, QueueItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Streaming,
    /// Terminal.
    Stopped,
}

/// Per-session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Maximum entries per stream; bounds redelivery after a failure.
    pub window: usize,
    pub batch_wait: Duration,
    pub retry_backoff: Duration,
    pub retain_acked: usize,
}

/// Totals reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub streams: u64,
    pub delivered: u64,
    pub failures: u64,
}

enum Delivery {
    Delivered(usize),
    Failed(TransportError),
}

pub struct UplinkSession {
    kind: StreamKind,
    queue: Arc<DurableQueue>,
    uplink: Arc<dyn Uplink>,
    config: SessionConfig,
    stop: CancellationToken,
    state: watch::Sender<SessionState>,
    stats: SessionStats,
}

impl UplinkSession {
    pub fn new(
        kind: StreamKind,
        queue: Arc<DurableQueue>,
        uplink: Arc<dyn Uplink>,
        config: SessionConfig,
        stop: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            kind,
            queue,
            uplink,
            config,
            stop,
            state,
            stats: SessionStats::default(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Run until the stop token is cancelled.
    ///
    /// Returns `Err` only for storage failures, which break the durability
    /// guarantee and must end the process.
    pub async fn run(mut self) -> Result<SessionStats, QueueError> {
        info!(
            stream = %self.kind,
            window = self.config.window,
            backoff_secs = self.config.retry_backoff.as_secs(),
            "Uplink session started"
        );

        let result = self.drive().await;
        self.set_state(SessionState::Stopped);

        match &result {
            Ok(stats) => info!(
                stream = %self.kind,
                streams = stats.streams,
                delivered = stats.delivered,
                failures = stats.failures,
                "Uplink session stopped"
            ),
            Err(e) => error!(stream = %self.kind, error = %e, "Uplink session failed: queue storage error"),
        }
        result
    }

    async fn drive(&mut self) -> Result<SessionStats, QueueError> {
        'session: while !self.stop.is_cancelled() {
            let resumed = self.queue.resume_unacked()?;
            if resumed > 0 {
                debug!(stream = %self.kind, resumed, "Unacked entries returned to ready");
            }
            self.set_state(SessionState::Disconnected);

            loop {
                let batch = tokio::select! {
                    biased;
                    () = self.stop.cancelled() => break 'session,
                    batch = self.queue.get_batch(self.config.window, self.config.batch_wait) => batch?,
                };
                if batch.is_empty() {
                    continue;
                }

                self.set_state(SessionState::Streaming);
                match self.deliver(batch).await? {
                    Delivery::Delivered(count) => {
                        debug!(stream = %self.kind, count, "Batch delivered");
                        self.set_state(SessionState::Disconnected);
                    }
                    Delivery::Failed(e) => {
                        self.stats.failures += 1;
                        if e.is_unavailable() {
                            info!(stream = %self.kind, error = %e, "Device service unavailable, will retry");
                        } else {
                            warn!(stream = %self.kind, error = %e, "Stream to device service failed, will retry");
                        }
                        self.set_state(SessionState::Disconnected);

                        tokio::select! {
                            () = self.stop.cancelled() => break 'session,
                            () = tokio::time::sleep(self.config.retry_backoff) => {}
                        }
                        continue 'session;
                    }
                }
            }
        }
        Ok(self.stats)
    }

    /// Stream one batch; ack what was fed if the call succeeds.
    async fn deliver(&mut self, batch: Vec<QueueItem>) -> Result<Delivery, QueueError> {
        let ids: Vec<u64> = batch.iter().map(|item| item.id).collect();
        let fed = Arc::new(AtomicUsize::new(0));

        let items = {
            let stop = self.stop.clone();
            let fed = Arc::clone(&fed);
            futures::stream::iter(batch)
                .take_while(move |_| futures::future::ready(!stop.is_cancelled()))
                .map(move |item| {
                    fed.fetch_add(1, Ordering::AcqRel);
                    item.payload
                })
                .boxed()
        };

        self.stats.streams += 1;
        if let Err(e) = self.uplink.stream(self.kind, items).await {
            return Ok(Delivery::Failed(e));
        }

        // A stop mid-batch ends the stream early; only the fed prefix was sent.
        let fed = fed.load(Ordering::Acquire);
        for id in ids.iter().take(fed) {
            self.queue.ack(*id)?;
        }
        self.queue.trim_acked(self.config.retain_acked)?;
        self.stats.delivered += fed as u64;
        Ok(Delivery::Delivered(fed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::QueueOptions;
    use crate::uplink::transport::PayloadStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every payload it receives; fails calls listed in `fail_calls`
    /// after consuming `fail_after` items.
    #[derive(Default)]
    struct RecordingUplink {
        received: Mutex<Vec<Vec<u8>>>,
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
        fail_after: usize,
    }

    #[async_trait]
    impl Uplink for RecordingUplink {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stream(&self, _kind: StreamKind, mut items: PayloadStream) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_calls.contains(&call);
            let mut consumed = 0;
            while let Some(item) = items.next().await {
                if failing && consumed == self.fail_after {
                    return Err(TransportError::Status(tonic::Status::unavailable("reset")));
                }
                self.received.lock().unwrap().push(item);
                consumed += 1;
            }
            if failing {
                return Err(TransportError::Status(tonic::Status::internal("late failure")));
            }
            Ok(())
        }
    }

    fn config(window: usize) -> SessionConfig {
        SessionConfig {
            window,
            batch_wait: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(20),
            retain_acked: 100,
        }
    }

    async fn wait_for_drain(queue: &DurableQueue) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().pending() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(tmp.path().join("q"), QueueOptions::default()).unwrap());
        for i in 0..7u8 {
            queue.put(&[i]).await.unwrap();
        }

        let uplink = Arc::new(RecordingUplink::default());
        let stop = CancellationToken::new();
        let session = UplinkSession::new(StreamKind::State, Arc::clone(&queue), uplink.clone(), config(3), stop.clone());
        let task = tokio::spawn(session.run());

        wait_for_drain(&queue).await;
        stop.cancel();
        let stats = task.await.unwrap().unwrap();

        let received = uplink.received.lock().unwrap().clone();
        assert_eq!(received, (0..7u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(stats.delivered, 7);
        // 3 + 3 + 1
        assert_eq!(stats.streams, 3);
        assert_eq!(queue.stats().acked, 7);
    }

    #[tokio::test]
    async fn test_mid_batch_failure_redelivers_remainder() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(tmp.path().join("q"), QueueOptions::default()).unwrap());
        for i in 0..4u8 {
            queue.put(&[i]).await.unwrap();
        }

        let uplink = Arc::new(RecordingUplink {
            fail_calls: vec![0],
            fail_after: 2,
            ..Default::default()
        });
        let stop = CancellationToken::new();
        let session = UplinkSession::new(StreamKind::Event, Arc::clone(&queue), uplink.clone(), config(4), stop.clone());
        let task = tokio::spawn(session.run());

        wait_for_drain(&queue).await;
        stop.cancel();
        let stats = task.await.unwrap().unwrap();

        // First two were seen by the server before the failure and are sent again
        let received = uplink.received.lock().unwrap().clone();
        assert_eq!(received, vec![vec![0], vec![1], vec![0], vec![1], vec![2], vec![3]]);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.delivered, 4);
        assert_eq!(queue.stats().acked, 4);
    }

    #[tokio::test]
    async fn test_failure_after_full_stream_redelivers_whole_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(tmp.path().join("q"), QueueOptions::default()).unwrap());
        queue.put(b"x").await.unwrap();

        let uplink = Arc::new(RecordingUplink {
            fail_calls: vec![0],
            fail_after: usize::MAX,
            ..Default::default()
        });
        let stop = CancellationToken::new();
        let session = UplinkSession::new(StreamKind::State, Arc::clone(&queue), uplink.clone(), config(5), stop.clone());
        let task = tokio::spawn(session.run());

        wait_for_drain(&queue).await;
        stop.cancel();
        task.await.unwrap().unwrap();

        // The failed call received the item but acked nothing; the retry
        // resent it and only then was it acked
        assert_eq!(uplink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*uplink.received.lock().unwrap(), vec![b"x".to_vec(), b"x".to_vec()]);
        assert_eq!(queue.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_reaches_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(tmp.path().join("q"), QueueOptions::default()).unwrap());
        let stop = CancellationToken::new();
        let session = UplinkSession::new(
            StreamKind::State,
            queue,
            Arc::new(RecordingUplink::default()),
            SessionConfig { batch_wait: Duration::from_secs(30), ..config(5) },
            stop.clone(),
        );
        let mut state = session.subscribe();
        let task = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*state.borrow(), SessionState::Disconnected);

        stop.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(stats, SessionStats::default());
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), SessionState::Stopped);
    }
}
