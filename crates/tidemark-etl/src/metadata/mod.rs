//! Persisted per-pipeline checkpoints
//!
//! One [`PipelineCheckpoint`] per `(group_id, pipeline_name)`. The
//! orchestrator reads it before a run and overwrites it when the run starts
//! and when it ends; nothing in the engine deletes it except an explicit
//! rerun.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryMetadataRepository;
pub use postgres::PgMetadataRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::result::EtlStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub group_id: String,
    pub pipeline_name: String,
    /// Every row at or before this timestamp has been committed to every sink
    pub last_processed_at: DateTime<Utc>,
    pub last_run_at: DateTime<Utc>,
    pub status: EtlStatus,
    /// Figures of the last run
    pub duration_ms: i64,
    pub rows_processed: i64,
    pub error_message: Option<String>,
    /// Figures accumulated over every run since the checkpoint was created
    pub total_duration_ms: i64,
    pub total_rows_processed: i64,
}

impl PipelineCheckpoint {
    /// Sentinel for a pipeline that has never been run
    pub fn never_run(group_id: &str, pipeline_name: &str, init_timestamp: DateTime<Utc>) -> Self {
        Self {
            group_id: group_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            last_processed_at: init_timestamp,
            last_run_at: init_timestamp,
            status: EtlStatus::NeverRun,
            duration_ms: 0,
            rows_processed: 0,
            error_message: None,
            total_duration_ms: 0,
            total_rows_processed: 0,
        }
    }

    /// Same checkpoint marked as running since `now`
    pub fn loading(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_run_at: now,
            status: EtlStatus::Loading,
            error_message: None,
            ..self.clone()
        }
    }
}

/// Storage for pipeline checkpoints
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn get(&self, group_id: &str, pipeline_name: &str) -> Result<Option<PipelineCheckpoint>>;

    /// Insert or replace, atomically
    async fn put(&self, checkpoint: &PipelineCheckpoint) -> Result<()>;

    async fn delete(&self, group_id: &str, pipeline_name: &str) -> Result<()>;

    /// All checkpoints of a group, ordered by pipeline name
    async fn list(&self, group_id: &str) -> Result<Vec<PipelineCheckpoint>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn repository_is_object_safe() {
        fn _assert(_: Arc<dyn MetadataRepository>) {}
    }

    #[test]
    fn loading_keeps_the_committed_position() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let now = Utc.timestamp_opt(500, 0).unwrap();
        let mut checkpoint = PipelineCheckpoint::never_run("g", "p", epoch);
        checkpoint.last_processed_at = Utc.timestamp_opt(100, 0).unwrap();
        checkpoint.error_message = Some("old failure".into());

        let loading = checkpoint.loading(now);
        assert_eq!(loading.status, EtlStatus::Loading);
        assert_eq!(loading.last_processed_at, checkpoint.last_processed_at);
        assert_eq!(loading.last_run_at, now);
        assert!(loading.error_message.is_none());
    }
}
