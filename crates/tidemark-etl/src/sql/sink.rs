//! Loading into Postgres through a configured statement
//!
//! The commit statement receives the whole batch as one JSON array (`$1`)
//! and the group id (`$2`), e.g.
//!
//! ```sql
//! INSERT INTO coverage_daily (build, test, hits)
//! SELECT r.build, r.test, r.hits
//! FROM jsonb_to_recordset($1::jsonb) AS r(build text, test text, hits bigint)
//! ON CONFLICT (build, test) DO UPDATE SET hits = EXCLUDED.hits
//! ```
//!
//! The statement runs inside a transaction, so a batch lands whole or not at all.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::load::Sink;
use crate::result::BatchResult;
use crate::row::UntypedRow;

pub struct PgSink {
    name: String,
    pool: PgPool,
    commit_sql: String,
    delete_sql: Option<String>,
    processable_column: Option<String>,
}

impl PgSink {
    pub fn new(name: impl Into<String>, pool: PgPool, commit_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool,
            commit_sql: commit_sql.into(),
            delete_sql: None,
            processable_column: None,
        }
    }

    /// Statement run by `delete_all`, with the group id bound to `$1`
    pub fn with_delete_sql(mut self, delete_sql: impl Into<String>) -> Self {
        self.delete_sql = Some(delete_sql.into());
        self
    }

    /// Boolean column deciding whether a row is loaded
    pub fn with_processable_column(mut self, column: impl Into<String>) -> Self {
        self.processable_column = Some(column.into());
        self
    }
}

/// Rows whose column is explicitly `false` are skipped; missing or null counts as processable
fn processable(row: &UntypedRow, column: Option<&str>) -> bool {
    match column {
        Some(column) => !matches!(row.get(column), Some(Value::Bool(false))),
        None => true,
    }
}

fn batch_payload(batch: &[UntypedRow]) -> Value {
    Value::Array(batch.iter().map(|row| Value::Object(row.fields.clone())).collect())
}

#[async_trait]
impl Sink<UntypedRow> for PgSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_processable(&self, row: &UntypedRow) -> bool {
        processable(row, self.processable_column.as_deref())
    }

    async fn commit(&self, group_id: &str, batch: &[UntypedRow], batch_no: u32) -> Result<BatchResult> {
        let started = Instant::now();

        let mut tx = self.pool.begin().await?;
        let outcome = sqlx::query(&self.commit_sql)
            .bind(batch_payload(batch))
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EtlError::BatchCommit(format!("{}: {e}", self.name)))?;
        tx.commit().await?;

        debug!(
            sink = %self.name,
            group_id,
            batch = batch_no,
            rows = batch.len(),
            rows_affected = outcome.rows_affected(),
            "batch committed"
        );
        Ok(BatchResult::committed(batch.len() as u64, started.elapsed()))
    }

    async fn delete_all(&self, group_id: &str) -> Result<()> {
        let delete_sql = self
            .delete_sql
            .as_deref()
            .ok_or_else(|| EtlError::config(format!("sink '{}' has no delete statement", self.name)))?;

        let outcome = sqlx::query(delete_sql)
            .bind(group_id)
            .execute(&self.pool)
            .await?;

        info!(sink = %self.name, group_id, rows = outcome.rows_affected(), "sink data deleted");
        Ok(())
    }
}
