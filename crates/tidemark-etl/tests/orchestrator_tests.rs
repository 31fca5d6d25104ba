//! Orchestrator runs against the in-memory metadata repository

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{init_tracing, pipeline, rows, ts, RecordingSink, TestRow, VecSource};
use std::sync::{Arc, Mutex};
use tidemark_etl::error::{EtlError, Result};
use tidemark_etl::load::{BatchLoader, Sink};
use tidemark_etl::metadata::{InMemoryMetadataRepository, MetadataRepository, PipelineCheckpoint};
use tidemark_etl::result::BatchResult;
use tidemark_etl::{EtlPipeline, EtlStatus, Orchestrator, Pipeline};

fn repository() -> Arc<InMemoryMetadataRepository> {
    Arc::new(InMemoryMetadataRepository::new())
}

fn orchestrator(repository: &Arc<InMemoryMetadataRepository>, pipelines: Vec<Pipeline<TestRow>>) -> Orchestrator {
    let repo: Arc<dyn MetadataRepository> = repository.clone();
    pipelines
        .into_iter()
        .fold(Orchestrator::new("test", "group-1", repo).with_batch_size(4), |o, p| {
            let p: Arc<dyn EtlPipeline> = Arc::new(p);
            o.with_pipeline(p)
        })
}

async fn checkpoint(repository: &InMemoryMetadataRepository, name: &str) -> PipelineCheckpoint {
    repository.get("group-1", name).await.unwrap().unwrap()
}

#[tokio::test]
async fn second_run_over_unchanged_source_processes_nothing() {
    init_tracing();
    let repo = repository();
    let sink = RecordingSink::new("sink");
    let o = orchestrator(&repo, vec![pipeline("orders", Arc::new(VecSource::new(rows(1..=10))), 100, &[sink.clone()])]);

    let first = o.run("orders").await.unwrap();
    assert_eq!(first.status, EtlStatus::Success);
    assert_eq!(first.rows_processed, 10);
    assert_eq!(first.last_processed_at, ts(10));
    assert_eq!(first.group_id, "group-1");

    let second = o.run("orders").await.unwrap();
    assert_eq!(second.status, EtlStatus::Success);
    assert_eq!(second.rows_processed, 0);
    assert_eq!(second.last_processed_at, ts(10));
    assert_eq!(sink.timestamps().len(), 10);

    let saved = checkpoint(&repo, "orders").await;
    assert_eq!(saved.status, EtlStatus::Success);
    assert_eq!(saved.last_processed_at, ts(10));
    assert_eq!(saved.rows_processed, 0);
    assert_eq!(saved.total_rows_processed, 10);
    assert!(saved.error_message.is_none());
}

#[tokio::test]
async fn new_rows_are_picked_up_from_the_checkpoint() {
    init_tracing();
    let repo = repository();
    let source = Arc::new(VecSource::new(rows(1..=5)));
    let sink = RecordingSink::new("sink");
    let o = orchestrator(&repo, vec![pipeline("orders", source.clone(), 100, &[sink.clone()])]);

    o.run("orders").await.unwrap();
    source.append(rows(6..=8));
    let result = o.run("orders").await.unwrap();

    assert_eq!(result.rows_processed, 3);
    assert_eq!(sink.timestamps(), (1..=8).collect::<Vec<_>>());
    let saved = checkpoint(&repo, "orders").await;
    assert_eq!(saved.last_processed_at, ts(8));
    assert_eq!(saved.total_rows_processed, 8);
}

#[tokio::test]
async fn failed_pipeline_does_not_stop_the_others() {
    init_tracing();
    let repo = repository();
    let broken = RecordingSink::failing_on("broken", 1);
    let healthy = RecordingSink::new("healthy");
    let o = orchestrator(
        &repo,
        vec![
            pipeline("first", Arc::new(VecSource::new(rows(1..=6))), 100, &[broken.clone()]),
            pipeline("second", Arc::new(VecSource::new(rows(1..=6))), 100, &[healthy.clone()]),
        ],
    );

    let results = o.run_all().await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].pipeline_name, "first");
    assert_eq!(results[0].status, EtlStatus::Failed);
    assert_eq!(results[0].last_processed_at, ts(0));
    assert_eq!(results[1].status, EtlStatus::Success);
    assert_eq!(healthy.timestamps().len(), 6);

    let failed = checkpoint(&repo, "first").await;
    assert_eq!(failed.status, EtlStatus::Failed);
    assert_eq!(failed.last_processed_at, ts(0));
    assert!(failed.error_message.unwrap().contains("unique constraint violated"));

    // the next run retries from the preserved checkpoint
    broken.heal();
    let retried = o.run("first").await.unwrap();
    assert_eq!(retried.status, EtlStatus::Success);
    assert_eq!(retried.rows_processed, 6);
}

#[tokio::test]
async fn panicking_pipeline_is_recorded_as_failed() {
    init_tracing();
    let repo = repository();
    let sink = RecordingSink::new("sink");
    let o = orchestrator(
        &repo,
        vec![
            pipeline("crashing", Arc::new(VecSource::panicking()), 100, &[sink.clone()]),
            pipeline("steady", Arc::new(VecSource::new(rows(1..=3))), 100, &[sink.clone()]),
        ],
    );

    let results = o.run_all().await;

    assert_eq!(results[0].status, EtlStatus::Failed);
    let message = results[0].error_message.clone().unwrap();
    assert!(message.contains("source driver crashed"), "got: {message}");
    assert_eq!(results[1].status, EtlStatus::Success);

    let saved = checkpoint(&repo, "crashing").await;
    assert_eq!(saved.status, EtlStatus::Failed);
    assert_eq!(saved.last_processed_at, ts(0));
}

#[tokio::test]
async fn unknown_pipeline_is_an_error() {
    let repo = repository();
    let o = orchestrator(&repo, Vec::new());
    assert!(matches!(o.run("missing").await, Err(EtlError::PipelineNotFound(name)) if name == "missing"));
}

#[tokio::test]
async fn status_lists_never_run_pipelines() {
    init_tracing();
    let repo = repository();
    let o = orchestrator(
        &repo,
        vec![
            pipeline("a", Arc::new(VecSource::new(rows(1..=2))), 100, &[RecordingSink::new("a")]),
            pipeline("b", Arc::new(VecSource::new(rows(1..=2))), 100, &[RecordingSink::new("b")]),
        ],
    )
    .with_init_timestamp(ts(0));

    o.run("a").await.unwrap();
    let status = o.status().await.unwrap();

    assert_eq!(status.len(), 2);
    assert_eq!(status[0].pipeline_name, "a");
    assert_eq!(status[0].status, EtlStatus::Success);
    assert_eq!(status[1].pipeline_name, "b");
    assert_eq!(status[1].status, EtlStatus::NeverRun);
    assert_eq!(status[1].last_processed_at, ts(0));
    assert!(repo.get("group-1", "b").await.unwrap().is_none());
}

#[tokio::test]
async fn init_timestamp_bounds_the_first_run() {
    init_tracing();
    let repo = repository();
    let sink = RecordingSink::new("sink");
    let o = orchestrator(&repo, vec![pipeline("orders", Arc::new(VecSource::new(rows(1..=10))), 100, &[sink.clone()])])
        .with_init_timestamp(ts(7));

    let result = o.run("orders").await.unwrap();

    assert_eq!(result.rows_processed, 3);
    assert_eq!(sink.timestamps(), vec![8, 9, 10]);
}

#[tokio::test]
async fn rerun_with_data_deletion_reloads_everything() {
    init_tracing();
    let repo = repository();
    let sink = RecordingSink::new("sink");
    let o = orchestrator(&repo, vec![pipeline("orders", Arc::new(VecSource::new(rows(1..=5))), 100, &[sink.clone()])]);

    o.run("orders").await.unwrap();
    let results = o.rerun(true).await.unwrap();

    assert_eq!(results[0].rows_processed, 5);
    assert_eq!(sink.deletes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(sink.timestamps(), (1..=5).collect::<Vec<_>>());
    // totals restart with the checkpoint
    assert_eq!(checkpoint(&repo, "orders").await.total_rows_processed, 5);
}

#[tokio::test]
async fn rerun_without_deletion_keeps_loaded_data() {
    init_tracing();
    let repo = repository();
    let sink = RecordingSink::new("sink");
    let o = orchestrator(&repo, vec![pipeline("orders", Arc::new(VecSource::new(rows(1..=5))), 100, &[sink.clone()])]);

    o.run("orders").await.unwrap();
    let results = o.rerun(false).await.unwrap();

    assert_eq!(results[0].rows_processed, 5);
    assert_eq!(sink.deletes.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(sink.timestamps().len(), 10);
}

/// Records the checkpoint status visible while a batch is being committed
struct ObservingSink {
    repository: Arc<InMemoryMetadataRepository>,
    seen: Mutex<Vec<(EtlStatus, DateTime<Utc>)>>,
}

#[async_trait]
impl Sink<TestRow> for ObservingSink {
    fn name(&self) -> &str {
        "observing"
    }

    async fn commit(&self, group_id: &str, batch: &[TestRow], _batch_no: u32) -> Result<BatchResult> {
        let current = self.repository.get(group_id, "orders").await?.unwrap();
        self.seen
            .lock()
            .unwrap()
            .push((current.status, current.last_processed_at));
        Ok(BatchResult::committed(batch.len() as u64, std::time::Duration::ZERO))
    }

    async fn delete_all(&self, _group_id: &str) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn checkpoint_reads_loading_while_the_pipeline_runs() {
    init_tracing();
    let repo = repository();
    let sink = Arc::new(ObservingSink {
        repository: repo.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let source: Arc<VecSource> = Arc::new(VecSource::new(rows(1..=3)));
    let p = Pipeline::new("orders", common::extractor(source, 100))
        .with_loader(BatchLoader::new(sink.clone() as Arc<dyn Sink<TestRow>>));
    let o = orchestrator(&repo, vec![p]);

    o.run("orders").await.unwrap();

    assert_eq!(*sink.seen.lock().unwrap(), vec![(EtlStatus::Loading, ts(0))]);
    assert_eq!(checkpoint(&repo, "orders").await.status, EtlStatus::Success);
}
