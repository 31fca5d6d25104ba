//! In-memory sources and sinks shared by the integration tests
//!
//! - [`VecSource`]: pages over a vector of rows, optionally failing or panicking
//! - [`RecordingSink`]: keeps every committed batch, optionally rejecting one
//! - [`init_tracing`]: routes engine logs to the test output

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tidemark_etl::error::{EtlError, Result};
use tidemark_etl::extract::{PageExtractor, PageSource};
use tidemark_etl::load::{BatchLoader, Sink};
use tidemark_etl::result::BatchResult;
use tidemark_etl::{EtlRow, Pipeline};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tidemark_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestRow {
    pub ts: DateTime<Utc>,
    pub key: String,
    pub value: i64,
}

impl TestRow {
    pub fn new(secs: i64, key: &str, value: i64) -> Self {
        Self {
            ts: ts(secs),
            key: key.to_string(),
            value,
        }
    }
}

impl EtlRow for TestRow {
    fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }
}

/// One row per timestamp, all under key "k" with value 1
pub fn rows(timestamps: impl IntoIterator<Item = i64>) -> Vec<TestRow> {
    timestamps.into_iter().map(|t| TestRow::new(t, "k", 1)).collect()
}

pub struct VecSource {
    rows: Mutex<Vec<TestRow>>,
    fail_from: Option<DateTime<Utc>>,
    panic: bool,
    pub pages: AtomicUsize,
}

impl VecSource {
    pub fn new(rows: Vec<TestRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fail_from: None,
            panic: false,
            pages: AtomicUsize::new(0),
        }
    }

    /// Fails every fetch starting at or after `since`
    pub fn failing_from(rows: Vec<TestRow>, since: DateTime<Utc>) -> Self {
        Self {
            fail_from: Some(since),
            ..Self::new(rows)
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn append(&self, more: Vec<TestRow>) {
        self.rows.lock().unwrap().extend(more);
    }
}

#[async_trait]
impl PageSource<TestRow> for VecSource {
    fn name(&self) -> &str {
        "vec"
    }

    async fn extract_page(
        &self,
        _group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TestRow>> {
        self.pages.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("source driver crashed");
        }
        if self.fail_from.is_some_and(|from| since >= from) {
            return Err(EtlError::Extraction("connection reset by peer".into()));
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.ts > since && r.ts <= until)
            .take(limit)
            .cloned()
            .collect())
    }
}

pub struct RecordingSink {
    name: String,
    batches: Mutex<Vec<Vec<TestRow>>>,
    fail_on_batch: Mutex<Option<u32>>,
    pub deletes: AtomicUsize,
}

impl RecordingSink {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            batches: Mutex::new(Vec::new()),
            fail_on_batch: Mutex::new(None),
            deletes: AtomicUsize::new(0),
        })
    }

    /// Rejects batch `batch_no` of every run until [`RecordingSink::heal`]
    pub fn failing_on(name: &str, batch_no: u32) -> Arc<Self> {
        let sink = Self::new(name);
        *sink.fail_on_batch.lock().unwrap() = Some(batch_no);
        sink
    }

    pub fn heal(&self) {
        *self.fail_on_batch.lock().unwrap() = None;
    }

    pub fn batches(&self) -> Vec<Vec<TestRow>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    /// Every committed row's timestamp, in seconds
    pub fn timestamps(&self) -> Vec<i64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|r| r.ts.timestamp())
            .collect()
    }

    pub fn as_sink(self: &Arc<Self>) -> Arc<dyn Sink<TestRow>> {
        self.clone()
    }
}

#[async_trait]
impl Sink<TestRow> for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn commit(&self, _group_id: &str, batch: &[TestRow], batch_no: u32) -> Result<BatchResult> {
        if *self.fail_on_batch.lock().unwrap() == Some(batch_no) {
            return Ok(BatchResult::failed("unique constraint violated"));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(BatchResult::committed(batch.len() as u64, Duration::from_millis(1)))
    }

    async fn delete_all(&self, _group_id: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().clear();
        Ok(())
    }
}

pub fn extractor(source: Arc<VecSource>, limit: usize) -> PageExtractor<TestRow> {
    let source: Arc<dyn PageSource<TestRow>> = source;
    PageExtractor::new(source, limit)
}

/// Pipeline from `source` straight into every sink
pub fn pipeline(name: &str, source: Arc<VecSource>, limit: usize, sinks: &[Arc<RecordingSink>]) -> Pipeline<TestRow> {
    sinks.iter().fold(Pipeline::new(name, extractor(source, limit)), |pipeline, sink| {
        pipeline.with_loader(BatchLoader::new(sink.as_sink()))
    })
}
