//! Error types for the ETL engine

use chrono::{DateTime, Utc};
use std::any::Any;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Failures raised while extracting, transforming, loading or persisting
/// checkpoints.
///
/// Everything here ends a single run. Nothing is retried inside the engine;
/// the caller decides whether to run again.
#[derive(Error, Debug)]
pub enum EtlError {
    /// A row arrived with an earlier timestamp than one already seen in the run
    #[error("Timestamps are not in ascending order: {current} < {previous}")]
    OrderingViolation {
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    },

    /// A full page holds a single timestamp, so no safe page boundary exists
    #[error(
        "No rows could be emitted on page {page} because all {limit} fetched rows share one timestamp. \
         Please increase the extraction limit (current: {limit})."
    )]
    PageBoundaryAmbiguity { limit: usize, page: u32 },

    #[error("Batch commit failed: {0}")]
    BatchCommit(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Transformation failed: {0}")]
    Transform(String),

    /// The aggregator hand-off queue was full when an evicted group arrived
    #[error("Aggregation hand-off queue overflowed its capacity of {0} groups")]
    HandOffOverflow(usize),

    #[error("Metadata repository error: {0}")]
    Repository(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline '{0}' is not registered with this orchestrator")]
    PipelineNotFound(String),

    #[error("Pipeline panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    pub fn ordering(current: DateTime<Utc>, previous: DateTime<Utc>) -> Self {
        Self::OrderingViolation { current, previous }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn repository(message: impl std::fmt::Display) -> Self {
        Self::Repository(message.to_string())
    }

    /// Turn a caught panic payload into [`EtlError::Panicked`]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            message.to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}
