//! Ingest loop: receiver messages in, queued state updates out.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquisition::{MessageSource, NavigationAggregator, SourceError};
use crate::config::LocationConfig;
use crate::storage::QueueError;
use crate::types::{FixMode, LocationRecord, StatusMap};
use crate::uplink::DeviceClient;

/// Event type emitted when the forwarded fix mode changes.
pub const FIX_MODE_CHANGED: &str = "fix_mode_changed";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("receiver source failed: {0}")]
    Source(#[source] SourceError),
    #[error("queue storage failed: {0}")]
    Storage(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub messages: u64,
    pub protocol_errors: u64,
    /// Records emitted by the aggregator, before decimation.
    pub records: u64,
    pub forwarded: u64,
    pub decimated: u64,
    pub unusable_fix: u64,
    /// Records dropped because the state queue was full.
    pub dropped_full: u64,
    pub events: u64,
}

pub struct IngestLoop {
    aggregator: NavigationAggregator,
    client: Arc<DeviceClient>,
    decimate: u64,
    fix_change_events: bool,
    cancel: CancellationToken,
    last_fix: Option<FixMode>,
    stats: IngestStats,
}

impl IngestLoop {
    pub fn new(
        aggregator: NavigationAggregator,
        client: Arc<DeviceClient>,
        location: &LocationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            client,
            decimate: u64::from(location.decimate.max(1)),
            fix_change_events: location.fix_change_events,
            cancel,
            last_fix: None,
            stats: IngestStats::default(),
        }
    }

    /// Run until the source ends, fails, or the token is cancelled.
    pub async fn run(mut self, source: &mut MessageSource) -> Result<IngestStats, IngestError> {
        info!(
            source = source.name(),
            decimate = self.decimate,
            required = ?self.aggregator.required(),
            "Ingest loop started"
        );

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("Ingest loop received shutdown signal");
                    break;
                }
                next = source.next_message() => next,
            };

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    info!(records = self.stats.records, "Receiver source reached end of stream");
                    break;
                }
                Err(e) if e.is_fatal() => return Err(IngestError::Source(e)),
                Err(e) => {
                    self.stats.protocol_errors += 1;
                    warn!(error = %e, "Dropping malformed receiver message");
                    continue;
                }
            };

            self.stats.messages += 1;
            if let Some(record) = self.aggregator.push(msg) {
                self.handle_record(record).await?;
            }
        }

        let agg = self.aggregator.stats();
        info!(
            messages = self.stats.messages,
            records = self.stats.records,
            forwarded = self.stats.forwarded,
            dropped_groups = agg.dropped_groups,
            "Ingest loop stopped"
        );
        Ok(self.stats)
    }

    async fn handle_record(&mut self, record: LocationRecord) -> Result<(), QueueError> {
        let index = self.stats.records;
        self.stats.records += 1;
        if index % self.decimate != 0 {
            self.stats.decimated += 1;
            return Ok(());
        }

        let fix = record.fix_mode();
        if !fix.is_usable() {
            self.stats.unusable_fix += 1;
            warn!(fix_mode = %fix, "Skipping record without a usable fix");
            return Ok(());
        }

        if self.fix_change_events {
            if let Some(previous) = self.last_fix.filter(|prev| *prev != fix) {
                let mut payload = StatusMap::new();
                payload.insert("from".into(), previous.as_str().into());
                payload.insert("to".into(), fix.as_str().into());
                let queued = self.client.add_event(
                    FIX_MODE_CHANGED,
                    &payload,
                    Some(record.position.lat),
                    Some(record.position.lon),
                );
                let Some(queued) = unless_cancelled(&self.cancel, queued).await else {
                    return Ok(());
                };
                match queued {
                    Ok(_) => self.stats.events += 1,
                    Err(e) if !e.is_fatal() => warn!(error = %e, "Dropping fix mode event"),
                    Err(e) => return Err(e),
                }
            }
        }
        self.last_fix = Some(fix);

        let Some(queued) = unless_cancelled(&self.cancel, self.client.send_location(&record)).await
        else {
            return Ok(());
        };
        match queued {
            Ok(id) => {
                self.stats.forwarded += 1;
                debug!(id, fix_mode = %fix, "Record forwarded");
            }
            Err(e) if !e.is_fatal() => {
                self.stats.dropped_full += 1;
                warn!(error = %e, "Dropping record");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Run `fut` unless `cancel` fires first.
///
/// A queue at capacity under `Overflow::Block` parks `put` until the uplink
/// drains it, which never happens while the server is unreachable. Dropping a
/// parked put loses nothing: the entry is only written after the wait.
async fn unless_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
