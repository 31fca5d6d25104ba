//! Batch loader
//!
//! Consumes one ascending stream and commits it to a [`Sink`] in batches
//! whose boundaries fall between timestamp groups, so a checkpoint always
//! points at a group that was committed in full.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use crate::error::{EtlError, Result};
use crate::progress::{BatchInfo, EventCallback, LoadEvent, ProgressTicker};
use crate::result::{BatchResult, EtlStatus, RunResult};
use crate::row::EtlRow;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A row on its way to a sink.
///
/// `settled`, when present, is the latest timestamp up to which every input
/// row has been emitted at or before this one. A transformer that holds rows
/// back sets it, and committing `row` then moves the checkpoint no further.
/// Rows straight from the extractor carry no bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged<R> {
    pub row: R,
    pub settled: Option<DateTime<Utc>>,
}

impl<R> Staged<R> {
    pub fn new(row: R, settled: Option<DateTime<Utc>>) -> Self {
        Self { row, settled }
    }
}

impl<R> From<R> for Staged<R> {
    fn from(row: R) -> Self {
        Self { row, settled: None }
    }
}

/// Destination of committed batches, implemented by sink adapters
#[async_trait]
pub trait Sink<R: EtlRow>: Send + Sync {
    fn name(&self) -> &str;

    /// Rows rejected here are skipped without being an error
    fn is_processable(&self, _row: &R) -> bool {
        true
    }

    /// Commit one batch atomically. `batch_no` starts at 1 for every run.
    async fn commit(&self, group_id: &str, batch: &[R], batch_no: u32) -> Result<BatchResult>;

    /// Remove everything this sink loaded for `group_id`
    async fn delete_all(&self, group_id: &str) -> Result<()>;
}

pub struct BatchLoader<R: EtlRow> {
    sink: Arc<dyn Sink<R>>,
    progress_interval: Duration,
}

impl<R: EtlRow> Clone for BatchLoader<R> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            progress_interval: self.progress_interval,
        }
    }
}

#[derive(Default)]
struct LoadCounters {
    loaded: AtomicU64,
    skipped: AtomicU64,
    batches: AtomicU32,
}

impl<R: EtlRow> BatchLoader<R> {
    pub fn new(sink: Arc<dyn Sink<R>>) -> Self {
        Self {
            sink,
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub async fn delete_all(&self, group_id: &str) -> Result<()> {
        info!(loader = self.name(), group_id, "deleting loaded data");
        self.sink.delete_all(group_id).await
    }

    /// Load rows with timestamps in `(since, until]` from `input`.
    ///
    /// Never returns an error: failures end up in the returned result, whose
    /// `last_processed_at` is the end of the last batch committed in full.
    pub async fn load(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        batch_size: usize,
        mut input: BoxStream<'_, Result<Staged<R>>>,
        on_event: EventCallback<'_, LoadEvent>,
    ) -> RunResult {
        let batch_size = batch_size.max(1);
        let started = Instant::now();
        let counters = Arc::new(LoadCounters::default());
        let ticker = {
            let counters = counters.clone();
            let loader = self.name().to_string();
            let group_id = group_id.to_string();
            ProgressTicker::start(self.progress_interval, move || {
                info!(
                    loader = %loader,
                    group_id = %group_id,
                    loaded = counters.loaded.load(Ordering::Relaxed),
                    skipped = counters.skipped.load(Ordering::Relaxed),
                    batch = counters.batches.load(Ordering::Relaxed),
                    "loading in progress"
                );
            })
        };

        on_event(LoadEvent::Started);
        debug!(loader = self.name(), group_id, since = %since, until = %until, "loading rows");

        let mut total = RunResult::started(since);
        let mut buffer: Vec<R> = Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE));
        let mut previous: Option<DateTime<Utc>> = None;
        let mut settled: Option<DateTime<Utc>> = None;
        let mut failure: Option<String> = None;

        while let Some(item) = input.next().await {
            let Staged { row, settled: bound } = match item {
                Ok(staged) => staged,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            };
            let current = row.timestamp();

            if let Some(previous) = previous {
                if current < previous {
                    failure = Some(EtlError::ordering(current, previous).to_string());
                    break;
                }
            }

            if current <= since {
                previous = Some(current);
                settled = bound;
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if current > until {
                break;
            }

            if let Some(boundary) = previous {
                if current != boundary && buffer.len() >= batch_size {
                    let checkpoint = checkpoint_after(boundary, settled, since);
                    match self.flush(group_id, &mut buffer, checkpoint, &counters).await {
                        Ok(batch) => {
                            total += batch.result.clone();
                            on_event(LoadEvent::BatchCommitted(batch.into_info(total.clone())));
                        }
                        Err(message) => {
                            failure = Some(message);
                            break;
                        }
                    }
                }
            }

            previous = Some(current);
            settled = bound;

            if !self.sink.is_processable(&row) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            buffer.push(row);
            counters.loaded.fetch_add(1, Ordering::Relaxed);
        }
        drop(input);

        if failure.is_none() {
            match previous.filter(|_| !buffer.is_empty()) {
                Some(boundary) => match self
                    .flush(group_id, &mut buffer, checkpoint_after(boundary, settled, since), &counters)
                    .await
                {
                    Ok(batch) => {
                        total += batch.result.clone();
                        on_event(LoadEvent::BatchCommitted(batch.into_info(total.clone())));
                    }
                    Err(message) => failure = Some(message),
                },
                None => {
                    // nothing buffered: everything seen so far is done
                    if let Some(last_seen) = previous {
                        let checkpoint = checkpoint_after(last_seen, settled, since);
                        total.last_processed_at = total.last_processed_at.max(checkpoint);
                    }
                }
            }
        }

        ticker.stop();

        match failure {
            Some(message) => {
                error!(loader = self.name(), group_id, error = %message, "loading failed");
                total += RunResult::failed(total.last_processed_at, message);
            }
            None => total.status = EtlStatus::Success,
        }
        total.duration = started.elapsed();

        info!(
            loader = self.name(),
            group_id,
            status = %total.status,
            rows = total.processed_rows,
            skipped = counters.skipped.load(Ordering::Relaxed),
            batches = counters.batches.load(Ordering::Relaxed),
            last_processed_at = %total.last_processed_at,
            "loading finished"
        );
        on_event(LoadEvent::Completed(total.clone()));
        total
    }

    /// Commit and clear `buffer`; `checkpoint` is the timestamp the
    /// checkpoint may advance to once the commit succeeded.
    async fn flush(
        &self,
        group_id: &str,
        buffer: &mut Vec<R>,
        checkpoint: DateTime<Utc>,
        counters: &LoadCounters,
    ) -> std::result::Result<CommittedBatch, String> {
        let batch_no = counters.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let outcome = self.sink.commit(group_id, buffer.as_slice(), batch_no).await;
        let size = buffer.len();
        buffer.clear();

        match outcome {
            Ok(BatchResult {
                success: true,
                rows_committed,
                duration,
                ..
            }) => {
                let duration = if duration.is_zero() {
                    started.elapsed()
                } else {
                    duration
                };
                trace!(loader = self.name(), group_id, batch = batch_no, rows = rows_committed, "batch committed");
                Ok(CommittedBatch {
                    batch_no,
                    result: RunResult::committed(rows_committed, checkpoint, duration),
                })
            }
            Ok(BatchResult { error_message, .. }) => Err(format!(
                "batch {batch_no} of {size} rows was rejected by {}: {}",
                self.name(),
                error_message.unwrap_or_else(|| "no reason given".to_string())
            )),
            Err(e) => Err(format!("batch {batch_no} of {size} rows failed in {}: {e}", self.name())),
        }
    }
}

/// Checkpoint once everything up to the row at `boundary` is committed
fn checkpoint_after(boundary: DateTime<Utc>, settled: Option<DateTime<Utc>>, since: DateTime<Utc>) -> DateTime<Utc> {
    settled.map_or(boundary, |settled| boundary.min(settled)).max(since)
}

struct CommittedBatch {
    batch_no: u32,
    result: RunResult,
}

impl CommittedBatch {
    fn into_info(self, total: RunResult) -> BatchInfo {
        BatchInfo {
            batch_no: self.batch_no,
            rows: self.result.processed_rows,
            last_processed_at: self.result.last_processed_at,
            duration: self.result.duration,
            total,
        }
    }
}
