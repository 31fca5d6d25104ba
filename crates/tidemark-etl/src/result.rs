//! Run status and result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::time::Duration;

/// Status of a run, a loader, or a persisted checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlStatus {
    /// Checkpoint sentinel for a pipeline that has never been run
    NeverRun,
    Loading,
    Success,
    Failed,
}

impl EtlStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EtlStatus::NeverRun => "never_run",
            EtlStatus::Loading => "loading",
            EtlStatus::Success => "success",
            EtlStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EtlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EtlStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "loading" => EtlStatus::Loading,
            "success" => EtlStatus::Success,
            "failed" => EtlStatus::Failed,
            _ => EtlStatus::NeverRun,
        }
    }
}

/// Progress or final outcome of one loader run.
///
/// Results fold with `+`: counters and durations add, `last_processed_at`
/// keeps the later value, and the status becomes `Failed` as soon as either
/// side failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub status: EtlStatus,
    pub processed_rows: u64,
    pub last_processed_at: DateTime<Utc>,
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl RunResult {
    /// Empty in-progress result positioned at the start of the window
    pub fn started(since: DateTime<Utc>) -> Self {
        Self {
            status: EtlStatus::Loading,
            processed_rows: 0,
            last_processed_at: since,
            duration: Duration::ZERO,
            error_message: None,
        }
    }

    /// One committed batch
    pub fn committed(rows: u64, last_processed_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            status: EtlStatus::Loading,
            processed_rows: rows,
            last_processed_at,
            duration,
            error_message: None,
        }
    }

    pub fn failed(last_processed_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: EtlStatus::Failed,
            processed_rows: 0,
            last_processed_at,
            duration: Duration::ZERO,
            error_message: Some(message.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == EtlStatus::Failed
    }

    pub fn combine(self, other: RunResult) -> RunResult {
        let failed = self.is_failed() || other.is_failed();
        let error_message = match (self.error_message, other.error_message) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };
        RunResult {
            status: if failed { EtlStatus::Failed } else { other.status },
            processed_rows: self.processed_rows + other.processed_rows,
            last_processed_at: self.last_processed_at.max(other.last_processed_at),
            duration: self.duration + other.duration,
            error_message,
        }
    }
}

impl Add for RunResult {
    type Output = RunResult;

    fn add(self, rhs: RunResult) -> RunResult {
        self.combine(rhs)
    }
}

impl AddAssign for RunResult {
    fn add_assign(&mut self, rhs: RunResult) {
        let current = std::mem::replace(self, RunResult::started(rhs.last_processed_at));
        *self = current.combine(rhs);
    }
}

/// What a sink reports after committing one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub success: bool,
    pub rows_committed: u64,
    pub duration: Duration,
    pub error_message: Option<String>,
}

impl BatchResult {
    pub fn committed(rows: u64, duration: Duration) -> Self {
        Self {
            success: true,
            rows_committed: rows,
            duration,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            rows_committed: 0,
            duration: Duration::ZERO,
            error_message: Some(message.into()),
        }
    }
}

/// Reduced outcome of one pipeline execution across all of its loaders
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub pipeline_name: String,
    pub status: EtlStatus,
    /// Minimum over every loader, so no sink is ever skipped past
    pub last_processed_at: DateTime<Utc>,
    /// Rows committed, summed over all sinks
    pub rows_processed: u64,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub loaders: Vec<(String, RunResult)>,
}

impl PipelineResult {
    /// Fold loader results (and an extraction failure, if any) into one result.
    ///
    /// A pipeline with no loaders never advances past `since`.
    pub fn reduce(
        pipeline_name: impl Into<String>,
        since: DateTime<Utc>,
        extraction_error: Option<String>,
        loaders: Vec<(String, RunResult)>,
        duration: Duration,
    ) -> Self {
        let last_processed_at = loaders
            .iter()
            .map(|(_, result)| result.last_processed_at)
            .min()
            .unwrap_or(since)
            .max(since);
        let rows_processed = loaders.iter().map(|(_, r)| r.processed_rows).sum();
        let all_succeeded = loaders.iter().all(|(_, r)| r.status == EtlStatus::Success);

        let mut errors: Vec<String> = extraction_error.into_iter().collect();
        errors.extend(loaders.iter().filter_map(|(name, r)| {
            r.error_message
                .as_ref()
                .map(|message| format!("loader {name}: {message}"))
        }));

        let status = if all_succeeded && errors.is_empty() {
            EtlStatus::Success
        } else {
            EtlStatus::Failed
        };

        Self {
            pipeline_name: pipeline_name.into(),
            status,
            last_processed_at,
            rows_processed,
            duration,
            error_message: (!errors.is_empty()).then(|| errors.join("; ")),
            loaders,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == EtlStatus::Failed
    }
}

/// What the orchestrator reports for one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub group_id: String,
    pub pipeline_name: String,
    pub status: EtlStatus,
    pub last_processed_at: DateTime<Utc>,
    pub rows_processed: u64,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}
