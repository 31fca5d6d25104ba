//! Pipeline: one extractor feeding any number of loaders
//!
//! The extractor runs once per execution. Its output is fanned out to every
//! loader (optionally through a transformer), loaders run concurrently, and
//! their results are reduced so the pipeline checkpoint never passes a point
//! some sink has not committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::aggregate::Transformer;
use crate::error::Result;
use crate::extract::PageExtractor;
use crate::fanout::{fan_out, DEFAULT_RETENTION};
use crate::load::{BatchLoader, Staged};
use crate::progress::{EventCallback, ExtractEvent, LoadEvent, PipelineEvent};
use crate::result::PipelineResult;
use crate::row::EtlRow;

/// What the orchestrator drives, independent of the row type
#[async_trait]
pub trait EtlPipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Move rows in `(since, until]` from the source to every sink
    async fn execute(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        batch_size: usize,
        on_event: EventCallback<'_, PipelineEvent>,
    ) -> Result<PipelineResult>;

    /// Delete everything the sinks loaded for `group_id`
    async fn clean_up(&self, group_id: &str) -> Result<()>;
}

struct LoaderStage<R: EtlRow> {
    transformer: Option<Arc<dyn Transformer<R>>>,
    loader: BatchLoader<R>,
}

pub struct Pipeline<R: EtlRow> {
    name: String,
    extractor: PageExtractor<R>,
    stages: Vec<LoaderStage<R>>,
    buffer_size: usize,
}

impl<R: EtlRow> Pipeline<R> {
    pub fn new(name: impl Into<String>, extractor: PageExtractor<R>) -> Self {
        Self {
            name: name.into(),
            extractor,
            stages: Vec::new(),
            buffer_size: DEFAULT_RETENTION,
        }
    }

    pub fn with_loader(mut self, loader: BatchLoader<R>) -> Self {
        self.stages.push(LoaderStage {
            transformer: None,
            loader,
        });
        self
    }

    pub fn with_transformed_loader(mut self, transformer: Arc<dyn Transformer<R>>, loader: BatchLoader<R>) -> Self {
        self.stages.push(LoaderStage {
            transformer: Some(transformer),
            loader,
        });
        self
    }

    /// Capacity of the extraction channel and of the fan-out retention window
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    async fn run(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        batch_size: usize,
        on_event: EventCallback<'_, PipelineEvent>,
    ) -> PipelineResult {
        let started = Instant::now();
        if self.stages.is_empty() {
            warn!(pipeline = %self.name, "pipeline has no loaders, nothing to do");
            return PipelineResult::reduce(&self.name, since, None, Vec::new(), started.elapsed());
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let branches = fan_out(rx, self.stages.len(), self.buffer_size);

        let on_extract = |event: ExtractEvent| on_event(PipelineEvent::Extract(event));
        let extraction = self.extractor.extract(group_id, since, until, tx, &on_extract);

        let loads = self.stages.iter().zip(branches).map(|(stage, branch)| {
            let rows = branch.into_stream().map(Ok).boxed();
            let input = match &stage.transformer {
                Some(transformer) => transformer.transform(group_id, rows),
                None => rows.map(|row| row.map(Staged::from)).boxed(),
            };
            async move {
                let loader = stage.loader.name().to_string();
                let on_load = |event: LoadEvent| {
                    on_event(PipelineEvent::Load {
                        loader: loader.clone(),
                        event,
                    })
                };
                let result = stage
                    .loader
                    .load(group_id, since, until, batch_size, input, &on_load)
                    .await;
                (loader, result)
            }
        });

        let (extracted, loaded) = tokio::join!(extraction, join_all(loads));

        let extraction_error = extracted.err().map(|e| format!("extractor {}: {e}", self.extractor.name()));
        let result = PipelineResult::reduce(&self.name, since, extraction_error, loaded, started.elapsed());

        info!(
            pipeline = %self.name,
            group_id,
            status = %result.status,
            rows = result.rows_processed,
            last_processed_at = %result.last_processed_at,
            duration_ms = result.duration.as_millis() as u64,
            "pipeline execution finished"
        );
        result
    }
}

#[async_trait]
impl<R: EtlRow> EtlPipeline for Pipeline<R> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        batch_size: usize,
        on_event: EventCallback<'_, PipelineEvent>,
    ) -> Result<PipelineResult> {
        Ok(self.run(group_id, since, until, batch_size, on_event).await)
    }

    async fn clean_up(&self, group_id: &str) -> Result<()> {
        for stage in &self.stages {
            stage.loader.delete_all(group_id).await?;
        }
        Ok(())
    }
}
