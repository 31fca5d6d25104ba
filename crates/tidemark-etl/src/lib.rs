//! Tidemark ETL engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental, timestamp-checkpointed ETL. Each run moves the rows in
//! `(last_processed_at, now]` from a source to every sink of a pipeline and
//! records how far every sink got, so the next run resumes exactly there.
//!
//! - **Extraction**: [`extract::PageExtractor`] pages through a [`extract::PageSource`]
//!   without splitting timestamp groups
//! - **Fan-out**: [`fanout::fan_out`] shares one extraction between loaders
//! - **Transform**: [`aggregate::StreamingAggregator`] and [`aggregate::GroupingAggregator`]
//! - **Loading**: [`load::BatchLoader`] commits timestamp-aligned batches to a [`load::Sink`]
//! - **Orchestration**: [`orchestrator::Orchestrator`] persists checkpoints in a
//!   [`metadata::MetadataRepository`]
//! - **Postgres**: [`sql::PgPageSource`], [`sql::PgSink`], [`metadata::PgMetadataRepository`]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod extract;
pub mod fanout;
pub mod load;
pub mod metadata;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod result;
pub mod row;
pub mod sql;

pub use error::{EtlError, Result};
pub use orchestrator::Orchestrator;
pub use pipeline::{EtlPipeline, Pipeline};
pub use result::{EtlStatus, ProcessingResult};
pub use row::{EtlRow, UntypedRow};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tidemark - incremental ETL runner
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Pipeline definitions
    #[arg(long, env = "ETL_PIPELINES_FILE", default_value = "pipelines.toml", global = true)]
    pub pipelines: PathBuf,

    /// Print results as JSON instead of a table
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one pipeline from its last checkpoint
    Run {
        /// Pipeline name
        name: String,
    },

    /// Run every pipeline from its last checkpoint
    RunAll,

    /// Forget every checkpoint and run all pipelines from the start
    Rerun {
        /// Also delete everything the sinks loaded for the group
        #[arg(long)]
        delete_data: bool,
    },

    /// Show the checkpoint of every pipeline
    Status,
}
