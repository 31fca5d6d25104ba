//! Configuration for the `tidemark` binary
//!
//! Runtime settings come from the environment ([`EtlConfig`]); pipeline
//! definitions come from a TOML file ([`PipelinesFile`]):
//!
//! ```toml
//! [[pipelines]]
//! name = "coverage"
//! extract_sql = """
//!     SELECT * FROM raw.coverage
//!     WHERE group_id = :group_id AND created_at > :since AND created_at <= :until
//!     ORDER BY created_at LIMIT :limit
//! """
//! timestamp_column = "created_at"
//!
//! [[pipelines.sinks]]
//! name = "coverage_daily"
//! commit_sql = "INSERT INTO ... FROM jsonb_to_recordset($1::jsonb) ..."
//! delete_sql = "DELETE FROM coverage_daily WHERE group_id = $1"
//!
//! [pipelines.sinks.aggregate]
//! group_by = ["build", "test"]
//! sum = ["hits"]
//! ```

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tidemark_common::TidemarkError;

use crate::aggregate::streaming::DEFAULT_AGGREGATION_BUFFER;
use crate::aggregate::{FieldAggregation, GroupingAggregator, StreamingAggregator, Transformer};
use crate::error::Result;
use crate::extract::{PageExtractor, PageSource};
use crate::fanout::DEFAULT_RETENTION;
use crate::load::{BatchLoader, Sink, DEFAULT_BATCH_SIZE};
use crate::metadata::postgres::DEFAULT_SCHEMA;
use crate::pipeline::Pipeline;
use crate::row::UntypedRow;
use crate::sql::{PgPageSource, PgSink};

pub const DEFAULT_EXTRACTION_LIMIT: usize = 100_000;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_GROUP_ID: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct EtlConfig {
    pub batch_size: usize,
    pub extraction_limit: usize,
    pub fanout_buffer: usize,
    pub progress_interval_secs: u64,
    /// Starting point for pipelines that have never run
    pub init_timestamp: DateTime<Utc>,
    pub group_id: String,
    /// Schema holding the metadata table
    pub schema: String,
    /// Metadata and target database
    pub database_url: String,
    pub source_database_url: String,
}

impl EtlConfig {
    pub fn from_env() -> tidemark_common::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`EtlConfig::from_env`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> tidemark_common::Result<Self> {
        let database_url = lookup("DATABASE_URL").unwrap_or_default();
        let source_database_url = lookup("SOURCE_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let init_timestamp = match lookup("ETL_INIT_TIMESTAMP") {
            Some(value) => DateTime::parse_from_rfc3339(&value)
                .map_err(|e| TidemarkError::invalid_setting("ETL_INIT_TIMESTAMP", &value, e))?
                .with_timezone(&Utc),
            None => DateTime::UNIX_EPOCH,
        };

        let config = Self {
            batch_size: parse_setting(&lookup, "ETL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            extraction_limit: parse_setting(&lookup, "ETL_EXTRACTION_LIMIT", DEFAULT_EXTRACTION_LIMIT)?,
            fanout_buffer: parse_setting(&lookup, "ETL_FANOUT_BUFFER", DEFAULT_RETENTION)?,
            progress_interval_secs: parse_setting(
                &lookup,
                "ETL_PROGRESS_INTERVAL_SECS",
                DEFAULT_PROGRESS_INTERVAL_SECS,
            )?,
            init_timestamp,
            group_id: lookup("ETL_GROUP_ID").unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
            schema: lookup("ETL_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            database_url,
            source_database_url,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> tidemark_common::Result<()> {
        for (name, value) in [
            ("ETL_BATCH_SIZE", self.batch_size),
            ("ETL_EXTRACTION_LIMIT", self.extraction_limit),
            ("ETL_FANOUT_BUFFER", self.fanout_buffer),
        ] {
            if value == 0 {
                return Err(TidemarkError::invalid_setting(name, "0", "must be greater than 0"));
            }
        }
        if self.progress_interval_secs == 0 {
            return Err(TidemarkError::invalid_setting(
                "ETL_PROGRESS_INTERVAL_SECS",
                "0",
                "must be greater than 0",
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(TidemarkError::config("ETL_GROUP_ID must not be empty"));
        }
        if self.database_url.trim().is_empty() {
            return Err(TidemarkError::config("DATABASE_URL not set"));
        }
        if self.source_database_url.trim().is_empty() {
            return Err(TidemarkError::config("SOURCE_DATABASE_URL is empty"));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

fn parse_setting<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> tidemark_common::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| TidemarkError::invalid_setting(name, &value, e)),
        None => Ok(default),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinesFile {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Page query; may use `:group_id`, `:since`, `:until` and `:limit`
    pub extract_sql: String,
    pub timestamp_column: String,
    /// Overrides `ETL_EXTRACTION_LIMIT` for this pipeline
    pub extraction_limit: Option<usize>,
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,
    /// Receives the batch as a JSON array in `$1` and the group id in `$2`
    pub commit_sql: String,
    /// Receives the group id in `$1`
    pub delete_sql: Option<String>,
    pub processable_column: Option<String>,
    pub aggregate: Option<AggregateConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// LRU cache, evicted groups are emitted as they fall out
    #[default]
    Streaming,
    /// Hash map flushed whole once it passes `buffer_size` groups
    Grouping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateConfig {
    #[serde(flatten)]
    pub fields: FieldAggregation,
    #[serde(default)]
    pub strategy: AggregationStrategy,
    pub buffer_size: Option<usize>,
}

impl PipelinesFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipelines file {}", path.display()))?;
        let file: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse pipelines file {}", path.display()))?;
        file.validate()
            .with_context(|| format!("Invalid pipelines file {}", path.display()))?;
        Ok(file)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.name.trim().is_empty() {
                anyhow::bail!("pipeline name must not be empty");
            }
            if !names.insert(pipeline.name.as_str()) {
                anyhow::bail!("pipeline '{}' is defined more than once", pipeline.name);
            }
            if pipeline.sinks.is_empty() {
                anyhow::bail!("pipeline '{}' has no sinks", pipeline.name);
            }
            if pipeline.extraction_limit == Some(0) {
                anyhow::bail!("pipeline '{}': extraction_limit must be greater than 0", pipeline.name);
            }
            for sink in &pipeline.sinks {
                if let Some(aggregate) = &sink.aggregate {
                    if aggregate.fields.group_by.is_empty() {
                        anyhow::bail!(
                            "pipeline '{}', sink '{}': aggregate.group_by must not be empty",
                            pipeline.name,
                            sink.name
                        );
                    }
                    if aggregate.buffer_size == Some(0) {
                        anyhow::bail!(
                            "pipeline '{}', sink '{}': aggregate.buffer_size must be greater than 0",
                            pipeline.name,
                            sink.name
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// SQL pipeline reading from `source` and writing to `target`
    pub fn build(&self, config: &EtlConfig, source: &PgPool, target: &PgPool) -> Result<Pipeline<UntypedRow>> {
        let page_source: Arc<dyn PageSource<UntypedRow>> = Arc::new(PgPageSource::new(
            &self.name,
            source.clone(),
            &self.extract_sql,
            &self.timestamp_column,
        )?);
        let extractor = PageExtractor::new(page_source, self.extraction_limit.unwrap_or(config.extraction_limit));

        let mut pipeline = Pipeline::new(&self.name, extractor).with_buffer_size(config.fanout_buffer);
        for sink in &self.sinks {
            let loader = BatchLoader::new(sink.build(target)).with_progress_interval(config.progress_interval());
            pipeline = match sink.transformer(config) {
                Some(transformer) => pipeline.with_transformed_loader(transformer, loader),
                None => pipeline.with_loader(loader),
            };
        }
        Ok(pipeline)
    }
}

impl SinkConfig {
    fn build(&self, target: &PgPool) -> Arc<dyn Sink<UntypedRow>> {
        let mut sink = PgSink::new(&self.name, target.clone(), &self.commit_sql);
        if let Some(delete_sql) = &self.delete_sql {
            sink = sink.with_delete_sql(delete_sql);
        }
        if let Some(column) = &self.processable_column {
            sink = sink.with_processable_column(column);
        }
        Arc::new(sink)
    }

    fn transformer(&self, config: &EtlConfig) -> Option<Arc<dyn Transformer<UntypedRow>>> {
        let aggregate = self.aggregate.as_ref()?;
        let buffer_size = aggregate.buffer_size.unwrap_or(DEFAULT_AGGREGATION_BUFFER);
        let name = format!("{}-aggregation", self.name);
        let transformer: Arc<dyn Transformer<UntypedRow>> = match aggregate.strategy {
            AggregationStrategy::Streaming => Arc::new(
                StreamingAggregator::untyped(name, aggregate.fields.clone(), buffer_size)
                    .with_progress_interval(config.progress_interval()),
            ),
            AggregationStrategy::Grouping => {
                Arc::new(GroupingAggregator::untyped(name, aggregate.fields.clone(), buffer_size))
            }
        };
        Some(transformer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_the_database_is_set() {
        let config = EtlConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/etl")])).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.extraction_limit, 100_000);
        assert_eq!(config.fanout_buffer, 2000);
        assert_eq!(config.progress_interval(), Duration::from_secs(10));
        assert_eq!(config.init_timestamp, DateTime::UNIX_EPOCH);
        assert_eq!(config.group_id, "default");
        assert_eq!(config.schema, "etl");
        assert_eq!(config.source_database_url, "postgres://localhost/etl");
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let config = EtlConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/target"),
            ("SOURCE_DATABASE_URL", "postgres://localhost/source"),
            ("ETL_BATCH_SIZE", "250"),
            ("ETL_INIT_TIMESTAMP", "2024-03-01T00:00:00Z"),
            ("ETL_GROUP_ID", "shop"),
        ]))
        .unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.init_timestamp.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(config.group_id, "shop");
        assert_eq!(config.source_database_url, "postgres://localhost/source");
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = EtlConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/etl"),
            ("ETL_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ETL_BATCH_SIZE"), "got: {err}");

        let err = EtlConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/etl"),
            ("ETL_FANOUT_BUFFER", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ETL_FANOUT_BUFFER"), "got: {err}");

        assert!(EtlConfig::from_lookup(lookup(&[])).is_err());
    }

    const PIPELINES: &str = r#"
        [[pipelines]]
        name = "coverage"
        extract_sql = "SELECT * FROM raw.coverage WHERE created_at > :since AND created_at <= :until ORDER BY created_at LIMIT :limit"
        timestamp_column = "created_at"
        extraction_limit = 5000

        [[pipelines.sinks]]
        name = "coverage_raw"
        commit_sql = "INSERT INTO coverage_raw SELECT * FROM jsonb_populate_recordset(NULL::coverage_raw, $1::jsonb)"
        delete_sql = "DELETE FROM coverage_raw WHERE group_id = $1"

        [[pipelines.sinks]]
        name = "coverage_daily"
        commit_sql = "INSERT INTO coverage_daily SELECT * FROM jsonb_populate_recordset(NULL::coverage_daily, $1::jsonb)"
        processable_column = "is_processable"

        [pipelines.sinks.aggregate]
        group_by = ["build", "test"]
        sum = ["hits"]
        strategy = "grouping"
        buffer_size = 500
    "#;

    #[test]
    fn pipelines_file_loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PIPELINES.as_bytes()).unwrap();

        let pipelines = PipelinesFile::load(file.path()).unwrap();
        assert_eq!(pipelines.pipelines.len(), 1);
        let pipeline = &pipelines.pipelines[0];
        assert_eq!(pipeline.extraction_limit, Some(5000));
        assert_eq!(pipeline.sinks.len(), 2);
        assert!(pipeline.sinks[0].aggregate.is_none());

        let aggregate = pipeline.sinks[1].aggregate.as_ref().unwrap();
        assert_eq!(aggregate.fields.group_by, vec!["build", "test"]);
        assert_eq!(aggregate.fields.sum, vec!["hits"]);
        assert!(aggregate.fields.max.is_empty());
        assert_eq!(aggregate.strategy, AggregationStrategy::Grouping);
        assert_eq!(aggregate.buffer_size, Some(500));
    }

    #[test]
    fn duplicate_and_sinkless_pipelines_are_rejected() {
        let mut file: PipelinesFile = toml::from_str(PIPELINES).unwrap();
        file.pipelines.push(file.pipelines[0].clone());
        let err = file.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"), "got: {err}");

        let mut file: PipelinesFile = toml::from_str(PIPELINES).unwrap();
        file.pipelines[0].sinks.clear();
        assert!(file.validate().is_err());
    }

    #[test]
    fn missing_file_reports_the_path() {
        let err = PipelinesFile::load(Path::new("/nonexistent/pipelines.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/pipelines.toml"));
    }
}
