//! Orchestrator: runs named pipelines against their persisted checkpoints
//!
//! Per pipeline run:
//! 1. read the checkpoint (or start from a `never_run` sentinel)
//! 2. mark it `loading`
//! 3. execute the window `(last_processed_at, now]`
//! 4. write the final checkpoint
//!
//! Errors and panics raised by a pipeline are recorded as a failed run and
//! leave `last_processed_at` where it was. Pipelines run one at a time and a
//! failed one never stops the others.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{EtlError, Result};
use crate::load::DEFAULT_BATCH_SIZE;
use crate::metadata::{MetadataRepository, PipelineCheckpoint};
use crate::pipeline::EtlPipeline;
use crate::progress::{track_progress, ExtractEvent, LoadEvent, PipelineEvent};
use crate::result::{EtlStatus, ProcessingResult};

pub struct Orchestrator {
    name: String,
    group_id: String,
    pipelines: Vec<Arc<dyn EtlPipeline>>,
    repository: Arc<dyn MetadataRepository>,
    batch_size: usize,
    init_timestamp: DateTime<Utc>,
    progress_interval: Duration,
}

impl Orchestrator {
    pub fn new(name: impl Into<String>, group_id: impl Into<String>, repository: Arc<dyn MetadataRepository>) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
            pipelines: Vec::new(),
            repository,
            batch_size: DEFAULT_BATCH_SIZE,
            init_timestamp: DateTime::UNIX_EPOCH,
            progress_interval: Duration::from_secs(60),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn EtlPipeline>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Where a pipeline without a checkpoint starts from
    pub fn with_init_timestamp(mut self, init_timestamp: DateTime<Utc>) -> Self {
        self.init_timestamp = init_timestamp;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Run one pipeline by name
    pub async fn run(&self, pipeline_name: &str) -> Result<ProcessingResult> {
        let pipeline = self
            .pipelines
            .iter()
            .find(|p| p.name() == pipeline_name)
            .ok_or_else(|| EtlError::PipelineNotFound(pipeline_name.to_string()))?;
        Ok(self.run_pipeline(pipeline.as_ref()).await)
    }

    /// Run every pipeline, one after another
    pub async fn run_all(&self) -> Vec<ProcessingResult> {
        info!(orchestrator = %self.name, group_id = %self.group_id, pipelines = self.pipelines.len(), "ETL starting");
        let started = Instant::now();
        let completed = Arc::new(AtomicUsize::new(0));

        let tick = {
            let completed = completed.clone();
            let name = self.name.clone();
            let group_id = self.group_id.clone();
            let total = self.pipelines.len();
            move || {
                info!(
                    orchestrator = %name,
                    group_id = %group_id,
                    completed = completed.load(Ordering::Relaxed),
                    total,
                    "ETL still running"
                );
            }
        };

        let results = track_progress(self.progress_interval, tick, async {
            let mut results = Vec::with_capacity(self.pipelines.len());
            for pipeline in &self.pipelines {
                results.push(self.run_pipeline(pipeline.as_ref()).await);
                completed.fetch_add(1, Ordering::Relaxed);
            }
            results
        })
        .await;

        let rows: u64 = results.iter().map(|r| r.rows_processed).sum();
        let failures = results.iter().filter(|r| r.status == EtlStatus::Failed).count();
        info!(
            orchestrator = %self.name,
            group_id = %self.group_id,
            rows,
            failures,
            duration_ms = started.elapsed().as_millis() as u64,
            "ETL completed"
        );
        results
    }

    /// Forget every checkpoint and run all pipelines from the init timestamp.
    ///
    /// With `with_data_deletion` the sinks are emptied first.
    pub async fn rerun(&self, with_data_deletion: bool) -> Result<Vec<ProcessingResult>> {
        info!(orchestrator = %self.name, group_id = %self.group_id, with_data_deletion, "deleting checkpoints for rerun");
        for pipeline in &self.pipelines {
            self.repository.delete(&self.group_id, pipeline.name()).await?;
        }

        if with_data_deletion {
            for pipeline in &self.pipelines {
                info!(pipeline = pipeline.name(), group_id = %self.group_id, "deleting loaded data for rerun");
                pipeline.clean_up(&self.group_id).await?;
            }
        }

        Ok(self.run_all().await)
    }

    /// Current checkpoint of every configured pipeline, `never_run` sentinels included
    pub async fn status(&self) -> Result<Vec<PipelineCheckpoint>> {
        let mut stored: HashMap<String, PipelineCheckpoint> = self
            .repository
            .list(&self.group_id)
            .await?
            .into_iter()
            .map(|checkpoint| (checkpoint.pipeline_name.clone(), checkpoint))
            .collect();

        Ok(self
            .pipelines
            .iter()
            .map(|pipeline| {
                stored
                    .remove(pipeline.name())
                    .unwrap_or_else(|| PipelineCheckpoint::never_run(&self.group_id, pipeline.name(), self.init_timestamp))
            })
            .collect())
    }

    async fn run_pipeline(&self, pipeline: &dyn EtlPipeline) -> ProcessingResult {
        let name = pipeline.name();
        let started = Instant::now();
        let now = Utc::now();

        let previous = match self.load_checkpoint(name, now).await {
            Ok(previous) => previous,
            Err(e) => {
                error!(pipeline = name, group_id = %self.group_id, error = %e, "cannot read checkpoint, pipeline skipped");
                return self.result(name, EtlStatus::Failed, self.init_timestamp, 0, started, Some(e.to_string()));
            }
        };
        let since = previous.last_processed_at;
        debug!(pipeline = name, group_id = %self.group_id, since = %since, until = %now, "pipeline starting");

        let on_event = |event: PipelineEvent| log_event(name, &event);
        let outcome = AssertUnwindSafe(pipeline.execute(&self.group_id, since, now, self.batch_size, &on_event))
            .catch_unwind()
            .await;

        let (status, last_processed_at, rows, mut error_message) = match outcome {
            Ok(Ok(result)) => (
                result.status,
                result.last_processed_at.max(since),
                result.rows_processed,
                result.error_message,
            ),
            Ok(Err(e)) => (EtlStatus::Failed, since, 0, Some(e.to_string())),
            Err(panic) => (
                EtlStatus::Failed,
                since,
                0,
                Some(EtlError::panicked(panic.as_ref()).to_string()),
            ),
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let checkpoint = PipelineCheckpoint {
            last_processed_at,
            last_run_at: now,
            status,
            duration_ms,
            rows_processed: rows as i64,
            error_message: error_message.clone(),
            total_duration_ms: previous.total_duration_ms + duration_ms,
            total_rows_processed: previous.total_rows_processed + rows as i64,
            ..previous
        };

        let mut status = status;
        if let Err(e) = self.repository.put(&checkpoint).await {
            error!(pipeline = name, group_id = %self.group_id, error = %e, "cannot persist checkpoint");
            status = EtlStatus::Failed;
            error_message = Some(match error_message {
                Some(message) => format!("{message}; {e}"),
                None => e.to_string(),
            });
        }

        match status {
            EtlStatus::Failed => warn!(
                pipeline = name,
                group_id = %self.group_id,
                rows,
                last_processed_at = %last_processed_at,
                error = error_message.as_deref().unwrap_or_default(),
                "pipeline failed"
            ),
            _ => info!(
                pipeline = name,
                group_id = %self.group_id,
                rows,
                last_processed_at = %last_processed_at,
                "pipeline succeeded"
            ),
        }

        self.result(name, status, last_processed_at, rows, started, error_message)
    }

    /// Read the checkpoint and mark it as loading
    async fn load_checkpoint(&self, name: &str, now: DateTime<Utc>) -> Result<PipelineCheckpoint> {
        let previous = self
            .repository
            .get(&self.group_id, name)
            .await?
            .unwrap_or_else(|| PipelineCheckpoint::never_run(&self.group_id, name, self.init_timestamp));
        self.repository.put(&previous.loading(now)).await?;
        Ok(previous)
    }

    fn result(
        &self,
        name: &str,
        status: EtlStatus,
        last_processed_at: DateTime<Utc>,
        rows_processed: u64,
        started: Instant,
        error_message: Option<String>,
    ) -> ProcessingResult {
        ProcessingResult {
            group_id: self.group_id.clone(),
            pipeline_name: name.to_string(),
            status,
            last_processed_at,
            rows_processed,
            duration_ms: started.elapsed().as_millis() as u64,
            error_message,
        }
    }
}

fn log_event(pipeline: &str, event: &PipelineEvent) {
    match event {
        PipelineEvent::Extract(ExtractEvent::PageExtracted(page)) => debug!(
            pipeline,
            page = page.page,
            rows = page.rows_emitted,
            cursor = %page.cursor,
            "page extracted"
        ),
        PipelineEvent::Extract(ExtractEvent::Failed(message)) => {
            warn!(pipeline, error = %message, "extraction failed")
        }
        PipelineEvent::Load {
            loader,
            event: LoadEvent::BatchCommitted(batch),
        } => debug!(
            pipeline,
            loader = %loader,
            batch = batch.batch_no,
            rows = batch.rows,
            total = batch.total.processed_rows,
            "batch committed"
        ),
        PipelineEvent::Load { .. } => {}
    }
}
