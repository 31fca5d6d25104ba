//! Extraction from a configured Postgres query
//!
//! The query selects one page of source rows and may reference `:group_id`,
//! `:since`, `:until` and `:limit`. It is wrapped so every row comes back as
//! a JSON object next to its timestamp, which keeps the adapter schema-less.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Instant;
use tracing::debug;

use super::{bind_named_params, QueryParam};
use crate::error::{EtlError, Result};
use crate::extract::PageSource;
use crate::metadata::postgres::validate_identifier;
use crate::row::UntypedRow;

#[derive(Debug, sqlx::FromRow)]
struct SourceRecord {
    etl_timestamp: DateTime<Utc>,
    row: Value,
}

impl TryFrom<SourceRecord> for UntypedRow {
    type Error = EtlError;

    fn try_from(record: SourceRecord) -> Result<Self> {
        match record.row {
            Value::Object(fields) => Ok(UntypedRow::new(record.etl_timestamp, fields)),
            other => Err(EtlError::Extraction(format!(
                "expected a JSON object per source row, got {other}"
            ))),
        }
    }
}

pub struct PgPageSource {
    name: String,
    pool: PgPool,
    sql: String,
    params: Vec<QueryParam>,
}

impl PgPageSource {
    /// Build a source over `query`, ordered by `timestamp_column`
    pub fn new(name: impl Into<String>, pool: PgPool, query: &str, timestamp_column: &str) -> Result<Self> {
        let (sql, params) = page_sql(query, timestamp_column)?;
        Ok(Self {
            name: name.into(),
            pool,
            sql,
            params,
        })
    }
}

fn page_sql(query: &str, timestamp_column: &str) -> Result<(String, Vec<QueryParam>)> {
    validate_identifier(timestamp_column)?;
    let (inner, params) = bind_named_params(query.trim().trim_end_matches(';'))?;
    let sql = format!(
        "SELECT (q.{timestamp_column})::timestamptz AS etl_timestamp, row_to_json(q) AS row \
         FROM ({inner}) q ORDER BY 1"
    );
    Ok((sql, params))
}

#[async_trait]
impl PageSource<UntypedRow> for PgPageSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract_page(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<UntypedRow>> {
        let started = Instant::now();
        let mut query = sqlx::query_as::<_, SourceRecord>(&self.sql);
        for param in &self.params {
            query = match param {
                QueryParam::GroupId => query.bind(group_id),
                QueryParam::Since => query.bind(since),
                QueryParam::Until => query.bind(until),
                QueryParam::Limit => query.bind(i64::try_from(limit).unwrap_or(i64::MAX)),
            };
        }

        let records = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EtlError::Extraction(format!("{}: {e}", self.name)))?;

        debug!(
            source = %self.name,
            rows = records.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "page fetched"
        );
        records.into_iter().map(UntypedRow::try_from).collect()
    }
}
