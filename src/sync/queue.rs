//! Write-behind queue with batched flushes and bounded retries.
//!
//! Each queued operation moves `Pending -> InFlight -> {acknowledged | failed}`.
//! A failed operation returns to `Pending` with its retry count bumped until
//! the budget is spent, then it is dropped with a warning. Callers observe the
//! final result through the [`SyncHandle`] returned by [`SyncQueue::enqueue`].

use crate::cache::stats::CacheStatsAggregator;
use crate::core::config::SyncConfig;
use crate::core::{Clock, SyncError};
use crate::sync::backend::SyncBackend;
use crate::sync::operation::{SyncHandle, SyncOperation, SyncOutcome, SyncSink};
use crate::system::metrics::{Metrics, Timer};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Queue tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncQueueConfig {
    /// Operations sent per flush
    pub batch_size: usize,
    /// Retry budget stamped on submitted operations
    pub max_retries: u32,
    /// Retry 4xx rejections like any other failure
    pub retry_client_errors: bool,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: crate::sync::operation::DEFAULT_MAX_RETRIES,
            retry_client_errors: false,
        }
    }
}

impl From<&SyncConfig> for SyncQueueConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            retry_client_errors: config.retry_client_errors,
        }
    }
}

/// What one flush did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Operations sent to the backend
    pub attempted: usize,
    /// Operations acknowledged and removed
    pub acknowledged: usize,
    /// Operations that failed and went back to pending
    pub retried: usize,
    /// Operations dropped in this flush
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    InFlight,
}

struct QueueEntry {
    op: SyncOperation,
    state: EntryState,
    completion: Option<oneshot::Sender<SyncOutcome>>,
}

impl QueueEntry {
    fn settle(mut self, outcome: SyncOutcome) {
        if let Some(tx) = self.completion.take() {
            // Receiver may be gone; the caller chose not to wait.
            let _ = tx.send(outcome);
        }
    }
}

/// Clears the flushing flag when the flush ends, even on cancellation
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Returns unsettled batch entries to `Pending` when a flush is dropped mid-send
struct InFlightGuard<'a> {
    entries: &'a Mutex<Vec<QueueEntry>>,
    ids: Vec<String>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut released = 0;
        for entry in self.entries.lock().iter_mut() {
            if entry.state == EntryState::InFlight && self.ids.contains(&entry.op.id) {
                entry.state = EntryState::Pending;
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "flush cancelled; operations returned to pending");
        }
    }
}

/// Buffers local mutations and writes them behind to a [`SyncBackend`]
pub struct SyncQueue {
    entries: Mutex<Vec<QueueEntry>>,
    flushing: AtomicBool,
    backend: Arc<dyn SyncBackend>,
    config: SyncQueueConfig,
    stats: Arc<CacheStatsAggregator>,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Create an empty queue
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        config: SyncQueueConfig,
        stats: Arc<CacheStatsAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            flushing: AtomicBool::new(false),
            backend,
            config,
            stats,
            clock,
        }
    }

    /// Queue tuning in effect
    pub fn config(&self) -> &SyncQueueConfig {
        &self.config
    }

    /// Buffer an operation as-is; the handle settles when it leaves the queue
    pub fn enqueue(&self, op: SyncOperation) -> SyncHandle {
        let (tx, handle) = SyncHandle::channel(op.id.clone());
        trace!(op_id = %op.id, collection = %op.collection, kind = op.kind.as_str(), "enqueued sync operation");

        let mut entries = self.entries.lock();
        entries.push(QueueEntry { op, state: EntryState::Pending, completion: Some(tx) });
        update_depth(entries.len());
        handle
    }

    /// Operations still queued, in flight included
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// Copies of the queued operations in enqueue order
    pub fn pending(&self) -> Vec<SyncOperation> {
        self.entries.lock().iter().map(|entry| entry.op.clone()).collect()
    }

    /// Whether a flush is running
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Send up to `batch_size` pending operations concurrently.
    ///
    /// Returns an empty report immediately if another flush is running.
    pub async fn flush(&self) -> FlushReport {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            trace!("flush already in progress");
            return FlushReport::default();
        };

        let batch = self.take_batch();
        if batch.is_empty() {
            return FlushReport::default();
        }
        let _in_flight = InFlightGuard {
            entries: &self.entries,
            ids: batch.iter().map(|op| op.id.clone()).collect(),
        };

        let mut report = FlushReport { attempted: batch.len(), ..Default::default() };
        debug!(batch = batch.len(), "flushing sync queue");

        let sends = batch.iter().map(|op| async move {
            let timer = Timer::start(Metrics::global().map(|m| m.sync.request_duration.clone()));
            let result = self.backend.send(op).await;
            timer.finish();
            result
        });
        let results = join_all(sends).await;

        for (op, result) in batch.iter().zip(results) {
            self.apply_result(op, result, &mut report);
        }

        update_depth(self.size());
        report
    }

    /// Pending operations by priority desc, enqueue time asc; marks them in flight
    fn take_batch(&self) -> Vec<SyncOperation> {
        let mut entries = self.entries.lock();
        let mut candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state == EntryState::Pending)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| (Reverse(entries[i].op.priority), entries[i].op.enqueued_at));
        candidates.truncate(self.config.batch_size);

        candidates
            .into_iter()
            .map(|i| {
                entries[i].state = EntryState::InFlight;
                entries[i].op.clone()
            })
            .collect()
    }

    fn apply_result(&self, op: &SyncOperation, result: Result<(), SyncError>, report: &mut FlushReport) {
        let mut entries = self.entries.lock();
        let Some(pos) = entries.iter().position(|entry| entry.op.id == op.id) else {
            return;
        };

        match result {
            Ok(()) => {
                let entry = entries.remove(pos);
                drop(entries);
                self.stats.record_sync_completed(self.clock.now_millis());
                report.acknowledged += 1;
                entry.settle(SyncOutcome::Acknowledged);
            }
            Err(error) => {
                if let Some(metrics) = Metrics::global() {
                    metrics.sync.failed_attempts.inc();
                }

                let entry = &mut entries[pos];
                entry.op.retry_count += 1;
                let rejected = !self.config.retry_client_errors && !error.is_retryable();

                if rejected || entry.op.retries_exhausted() {
                    let entry = entries.remove(pos);
                    drop(entries);
                    warn!(
                        op_id = %entry.op.id,
                        collection = %entry.op.collection,
                        entity_id = %entry.op.entity_id,
                        attempts = entry.op.retry_count,
                        %error,
                        "dropping sync operation"
                    );
                    self.stats.record_sync_dropped();
                    report.dropped += 1;
                    let attempts = entry.op.retry_count;
                    entry.settle(SyncOutcome::Dropped { attempts, error });
                } else {
                    debug!(
                        op_id = %entry.op.id,
                        retry_count = entry.op.retry_count,
                        max_retries = entry.op.max_retries,
                        %error,
                        "sync operation failed, will retry"
                    );
                    entry.state = EntryState::Pending;
                    report.retried += 1;
                }
            }
        }
    }
}

impl SyncSink for SyncQueue {
    fn submit(&self, op: SyncOperation) -> SyncHandle {
        self.enqueue(op.with_max_retries(self.config.max_retries))
    }
}

fn update_depth(depth: usize) {
    if let Some(metrics) = Metrics::global() {
        metrics.sync.queue_depth.set(depth as i64);
    }
}
