//! Durable Queue: sled-backed outbound FIFO with acknowledgment semantics
//!
//! Every entry lives in exactly one of three named trees, keyed by its id as
//! big-endian `u64` so iteration order is id order:
//!
//! - `ready`: accepted, waiting to be dispatched
//! - `unacked`: handed to the uplink, delivery not yet confirmed
//! - `acked`: delivery confirmed, kept until retention trimming
//!
//! Moves between trees are multi-tree sled transactions, so a crash can never
//! leave an entry in two states or in none. Ids come from
//! `sled::Db::generate_id`, which stays monotonic across restarts.
//!
//! One producer (`put`) and one consumer (`get_batch` / `ack` /
//! `resume_unacked`) per queue. `Notify` handles only wake waiters; they never
//! guard entry state.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{IVec, Transactional, Tree};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

const READY_TREE: &str = "ready";
const UNACKED_TREE: &str = "unacked";
const ACKED_TREE: &str = "acked";

/// What `put` does when the queue is at its maximum depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    /// Wait until the consumer acks an entry.
    #[default]
    Block,
    /// Fail immediately with [`QueueError::QueueFull`].
    Reject,
}

/// Queue tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Maximum Ready + Unacked entries; `0` means unbounded.
    pub max_depth: usize,
    pub overflow: Overflow,
}

/// An entry handed out by [`DurableQueue::get_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Entry counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub acked: usize,
}

impl QueueStats {
    /// Entries not yet confirmed delivered.
    pub fn pending(&self) -> usize {
        self.ready + self.unacked
    }
}

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt queue key ({len} bytes, expected 8)")]
    CorruptKey { len: usize },
    #[error("queue full (max depth {max_depth})")]
    QueueFull { max_depth: usize },
}

impl QueueError {
    /// Storage-level failures break the durability contract.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::QueueFull { .. })
    }
}

/// Persistent, crash-safe FIFO of opaque payloads.
pub struct DurableQueue {
    path: PathBuf,
    db: sled::Db,
    ready: Tree,
    unacked: Tree,
    acked: Tree,
    options: QueueOptions,
    /// Ready + Unacked, mirrored in memory so bounded `put` stays O(1).
    depth: AtomicUsize,
    ready_signal: Notify,
    space_signal: Notify,
}

impl DurableQueue {
    /// Create or open a queue store at the given directory.
    pub fn open<P: AsRef<Path>>(path: P, options: QueueOptions) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let ready = db.open_tree(READY_TREE)?;
        let unacked = db.open_tree(UNACKED_TREE)?;
        let acked = db.open_tree(ACKED_TREE)?;

        let (ready_len, unacked_len) = (ready.len(), unacked.len());
        if ready_len + unacked_len > 0 {
            info!(
                path = %path.display(),
                ready = ready_len,
                unacked = unacked_len,
                "Durable queue opened with pending entries"
            );
        } else {
            debug!(path = %path.display(), "Durable queue opened (empty)");
        }

        Ok(Self {
            path,
            db,
            ready,
            unacked,
            acked,
            options,
            depth: AtomicUsize::new(ready_len + unacked_len),
            ready_signal: Notify::new(),
            space_signal: Notify::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a payload in state Ready and return its id.
    ///
    /// The entry is flushed to disk before this returns. On a bounded queue at
    /// capacity this waits for space (`Overflow::Block`) or fails with
    /// `QueueFull` (`Overflow::Reject`).
    pub async fn put(&self, payload: &[u8]) -> Result<u64, QueueError> {
        let max_depth = self.options.max_depth;
        if max_depth > 0 {
            while self.depth.load(Ordering::Acquire) >= max_depth {
                match self.options.overflow {
                    Overflow::Reject => return Err(QueueError::QueueFull { max_depth }),
                    Overflow::Block => {
                        debug!(max_depth, path = %self.path.display(), "Queue full, waiting for space");
                        self.space_signal.notified().await;
                    }
                }
            }
        }

        let id = self.db.generate_id()?;
        self.ready.insert(id.to_be_bytes(), payload)?;
        self.db.flush()?;

        self.depth.fetch_add(1, Ordering::AcqRel);
        self.ready_signal.notify_one();
        debug!(id, size_bytes = payload.len(), "Entry queued");
        Ok(id)
    }

    /// Move up to `max_n` Ready entries (lowest id first) to Unacked.
    ///
    /// Waits up to `wait` for an entry to become Ready; returns an empty
    /// batch on timeout.
    pub async fn get_batch(
        &self,
        max_n: usize,
        wait: Duration,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.take_ready(max_n)?;
            if !batch.is_empty() || max_n == 0 {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.ready_signal.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    fn take_ready(&self, max_n: usize) -> Result<Vec<QueueItem>, QueueError> {
        let mut keys: Vec<(u64, IVec)> = Vec::with_capacity(max_n);
        for key in self.ready.iter().keys().take(max_n) {
            let key = key?;
            keys.push((decode_id(&key)?, key));
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let moved = (&self.ready, &self.unacked)
            .transaction(
                |(ready, unacked)| -> ConflictableTransactionResult<Vec<QueueItem>, Infallible> {
                    let mut moved = Vec::with_capacity(keys.len());
                    for (id, key) in &keys {
                        if let Some(payload) = ready.remove(key)? {
                            unacked.insert(key, payload.clone())?;
                            moved.push(QueueItem {
                                id: *id,
                                payload: payload.to_vec(),
                            });
                        }
                    }
                    Ok(moved)
                },
            )
            .map_err(storage_failure)?;

        debug!(count = moved.len(), "Dispatched batch");
        Ok(moved)
    }

    /// Confirm delivery of an Unacked entry.
    ///
    /// Returns `false` (and changes nothing) when the id is not Unacked.
    pub fn ack(&self, id: u64) -> Result<bool, QueueError> {
        let key = id.to_be_bytes();
        let acked = (&self.unacked, &self.acked)
            .transaction(
                |(unacked, acked)| -> ConflictableTransactionResult<bool, Infallible> {
                    match unacked.remove(&key[..])? {
                        Some(payload) => {
                            acked.insert(&key[..], payload)?;
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                },
            )
            .map_err(storage_failure)?;

        if acked {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.space_signal.notify_one();
        } else {
            debug!(id, "Ack for entry that is not unacked, ignoring");
        }
        Ok(acked)
    }

    /// Return every Unacked entry to Ready.
    ///
    /// Ids are preserved, so resumed entries are dispatched before anything
    /// queued after them.
    pub fn resume_unacked(&self) -> Result<usize, QueueError> {
        let entries: Vec<(IVec, IVec)> = self.unacked.iter().collect::<Result<_, _>>()?;
        if entries.is_empty() {
            return Ok(0);
        }

        (&self.unacked, &self.ready)
            .transaction(
                |(unacked, ready)| -> ConflictableTransactionResult<(), Infallible> {
                    for (key, payload) in &entries {
                        unacked.remove(key)?;
                        ready.insert(key, payload)?;
                    }
                    Ok(())
                },
            )
            .map_err(storage_failure)?;

        self.ready_signal.notify_one();
        info!(count = entries.len(), path = %self.path.display(), "Resumed unacked entries");
        Ok(entries.len())
    }

    /// Delete Acked entries beyond the `keep_latest` most recent.
    pub fn trim_acked(&self, keep_latest: usize) -> Result<usize, QueueError> {
        let total = self.acked.len();
        if total <= keep_latest {
            return Ok(0);
        }

        let excess = total - keep_latest;
        let mut batch = sled::Batch::default();
        for key in self.acked.iter().keys().take(excess) {
            batch.remove(key?);
        }
        self.acked.apply_batch(batch)?;

        debug!(removed = excess, kept = keep_latest, "Trimmed acked entries");
        Ok(excess)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            acked: self.acked.len(),
        }
    }

    /// Ready + Unacked entries.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Ids currently in state Acked, oldest first.
    pub fn acked_ids(&self) -> Result<Vec<u64>, QueueError> {
        self.acked
            .iter()
            .keys()
            .map(|key| decode_id(&key?))
            .collect()
    }
}

fn decode_id(key: &[u8]) -> Result<u64, QueueError> {
    <[u8; 8]>::try_from(key)
        .map(u64::from_be_bytes)
        .map_err(|_| QueueError::CorruptKey { len: key.len() })
}

fn storage_failure(err: TransactionError<Infallible>) -> QueueError {
    match err {
        TransactionError::Abort(never) => match never {},
        TransactionError::Storage(e) => QueueError::Storage(e),
    }
}
