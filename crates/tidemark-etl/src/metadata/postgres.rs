//! Postgres checkpoint store
//!
//! One row per `(group_id, pipeline_name)` in `<schema>.etl_metadata`.
//! Every write is a single upsert statement, so a checkpoint is replaced
//! atomically or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use super::{MetadataRepository, PipelineCheckpoint};
use crate::error::{EtlError, Result};

pub const DEFAULT_SCHEMA: &str = "etl";
const TABLE: &str = "etl_metadata";

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRecord {
    group_id: String,
    pipeline_name: String,
    status: String,
    last_processed_at: DateTime<Utc>,
    last_run_at: DateTime<Utc>,
    duration_ms: i64,
    rows_processed: i64,
    error_message: Option<String>,
    total_duration_ms: i64,
    total_rows_processed: i64,
}

impl From<CheckpointRecord> for PipelineCheckpoint {
    fn from(record: CheckpointRecord) -> Self {
        Self {
            group_id: record.group_id,
            pipeline_name: record.pipeline_name,
            last_processed_at: record.last_processed_at,
            last_run_at: record.last_run_at,
            status: record.status.into(),
            duration_ms: record.duration_ms,
            rows_processed: record.rows_processed,
            error_message: record.error_message,
            total_duration_ms: record.total_duration_ms,
            total_rows_processed: record.total_rows_processed,
        }
    }
}

pub struct PgMetadataRepository {
    pool: PgPool,
    schema: String,
}

impl PgMetadataRepository {
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        validate_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    fn table(&self) -> String {
        format!("{}.{TABLE}", self.schema)
    }

    /// Create the schema and table if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_table_sql(&self.table()))
            .execute(&self.pool)
            .await?;

        info!(table = %self.table(), "metadata table ready");
        Ok(())
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            group_id TEXT NOT NULL,
            pipeline_name TEXT NOT NULL,
            status TEXT NOT NULL,
            last_processed_at TIMESTAMPTZ NOT NULL,
            last_run_at TIMESTAMPTZ NOT NULL,
            duration_ms BIGINT NOT NULL DEFAULT 0,
            rows_processed BIGINT NOT NULL DEFAULT 0,
            error_message TEXT,
            total_duration_ms BIGINT NOT NULL DEFAULT 0,
            total_rows_processed BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (group_id, pipeline_name)
        )
        "#
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (
            group_id, pipeline_name, status, last_processed_at, last_run_at,
            duration_ms, rows_processed, error_message, total_duration_ms, total_rows_processed
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (group_id, pipeline_name) DO UPDATE SET
            status = EXCLUDED.status,
            last_processed_at = EXCLUDED.last_processed_at,
            last_run_at = EXCLUDED.last_run_at,
            duration_ms = EXCLUDED.duration_ms,
            rows_processed = EXCLUDED.rows_processed,
            error_message = EXCLUDED.error_message,
            total_duration_ms = EXCLUDED.total_duration_ms,
            total_rows_processed = EXCLUDED.total_rows_processed,
            updated_at = NOW()
        "#
    )
}

const COLUMNS: &str = "group_id, pipeline_name, status, last_processed_at, last_run_at, \
     duration_ms, rows_processed, error_message, total_duration_ms, total_rows_processed";

/// Accept plain SQL identifiers only, since schema names are spliced into statements
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(EtlError::config(format!(
            "'{name}' is not a valid schema name (letters, digits and '_' only)"
        )))
    }
}

#[async_trait]
impl MetadataRepository for PgMetadataRepository {
    async fn get(&self, group_id: &str, pipeline_name: &str) -> Result<Option<PipelineCheckpoint>> {
        let record = sqlx::query_as::<_, CheckpointRecord>(&format!(
            "SELECT {COLUMNS} FROM {} WHERE group_id = $1 AND pipeline_name = $2",
            self.table()
        ))
        .bind(group_id)
        .bind(pipeline_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(EtlError::repository)?;

        Ok(record.map(PipelineCheckpoint::from))
    }

    async fn put(&self, checkpoint: &PipelineCheckpoint) -> Result<()> {
        sqlx::query(&upsert_sql(&self.table()))
            .bind(&checkpoint.group_id)
            .bind(&checkpoint.pipeline_name)
            .bind(checkpoint.status.as_str())
            .bind(checkpoint.last_processed_at)
            .bind(checkpoint.last_run_at)
            .bind(checkpoint.duration_ms)
            .bind(checkpoint.rows_processed)
            .bind(&checkpoint.error_message)
            .bind(checkpoint.total_duration_ms)
            .bind(checkpoint.total_rows_processed)
            .execute(&self.pool)
            .await
            .map_err(EtlError::repository)?;
        Ok(())
    }

    async fn delete(&self, group_id: &str, pipeline_name: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE group_id = $1 AND pipeline_name = $2",
            self.table()
        ))
        .bind(group_id)
        .bind(pipeline_name)
        .execute(&self.pool)
        .await
        .map_err(EtlError::repository)?;
        Ok(())
    }

    async fn list(&self, group_id: &str) -> Result<Vec<PipelineCheckpoint>> {
        let records = sqlx::query_as::<_, CheckpointRecord>(&format!(
            "SELECT {COLUMNS} FROM {} WHERE group_id = $1 ORDER BY pipeline_name",
            self.table()
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EtlError::repository)?;

        Ok(records.into_iter().map(PipelineCheckpoint::from).collect())
    }
}
