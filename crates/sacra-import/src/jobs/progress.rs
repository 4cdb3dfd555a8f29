//! Throttled progress persistence

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ImportResult;
use crate::models::JobCounters;

/// Destination for live job counters
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn flush(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()>;
}

/// When to persist counters: after `every_rows` processed rows or once
/// `interval` has passed since the last flush, whichever comes first.
/// `every_rows == 0` disables the row trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub every_rows: u64,
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every_rows: 25,
            interval: Duration::from_millis(1000),
        }
    }
}

impl FlushPolicy {
    fn is_due(&self, rows_since: u64, elapsed: Duration) -> bool {
        (self.every_rows > 0 && rows_since >= self.every_rows) || elapsed >= self.interval
    }
}

/// Observes counters after every row and flushes them when the policy says so
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    job_id: Uuid,
    policy: FlushPolicy,
    flushed_rows: i64,
    last_flush: Instant,
    flushes: u64,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, job_id: Uuid, policy: FlushPolicy) -> Self {
        Self {
            sink,
            job_id,
            policy,
            flushed_rows: 0,
            last_flush: Instant::now(),
            flushes: 0,
        }
    }

    /// Returns true when this call flushed
    pub async fn observe(&mut self, counters: &JobCounters) -> ImportResult<bool> {
        let rows_since = (counters.processed_rows - self.flushed_rows).max(0) as u64;
        if rows_since == 0 || !self.policy.is_due(rows_since, self.last_flush.elapsed()) {
            return Ok(false);
        }
        self.flush(counters).await?;
        Ok(true)
    }

    pub async fn flush(&mut self, counters: &JobCounters) -> ImportResult<()> {
        self.sink.flush(self.job_id, *counters).await?;
        self.flushed_rows = counters.processed_rows;
        self.last_flush = Instant::now();
        self.flushes += 1;
        tracing::debug!(
            job_id = %self.job_id,
            processed = counters.processed_rows,
            "Progress flushed"
        );
        Ok(())
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

/// In-memory sink that keeps every flushed snapshot
#[derive(Debug, Default)]
pub struct RecordingSink {
    snapshots: Mutex<Vec<(Uuid, JobCounters)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<(Uuid, JobCounters)> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn flush(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job_id, counters));
        Ok(())
    }
}
