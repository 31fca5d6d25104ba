//! Progress events and the periodic progress ticker

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::result::RunResult;

/// One page handed downstream by the pagination driver
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub page: u32,
    pub rows_fetched: usize,
    pub rows_emitted: usize,
    /// Exclusive lower bound of the next fetch
    pub cursor: DateTime<Utc>,
    pub duration: Duration,
}

/// One batch committed by a loader
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInfo {
    pub batch_no: u32,
    pub rows: u64,
    pub last_processed_at: DateTime<Utc>,
    pub duration: Duration,
    /// Running total of the loader after this batch
    pub total: RunResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractEvent {
    PageExtracted(PageInfo),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Started,
    BatchCommitted(BatchInfo),
    Completed(RunResult),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Extract(ExtractEvent),
    Load { loader: String, event: LoadEvent },
}

/// Observer callback for stage events
pub type EventCallback<'a, E> = &'a (dyn Fn(E) + Send + Sync);

/// A background task calling `tick` every `period` until stopped or dropped.
///
/// The first call happens one full period after start.
pub struct ProgressTicker {
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn start<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                tick();
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Run `job` with a ticker alongside it.
///
/// The ticker is stopped as soon as `job` resolves, and also when the
/// returned future is dropped before completion.
pub async fn track_progress<J, F>(period: Duration, tick: F, job: J) -> J::Output
where
    J: Future,
    F: FnMut() + Send + 'static,
{
    let ticker = ProgressTicker::start(period, tick);
    let output = job.await;
    ticker.stop();
    output
}
