//! Tidemark - command-line entry point

use anyhow::Context;
use clap::Parser;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::process;
use std::sync::Arc;
use tidemark_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tidemark_etl::config::{EtlConfig, PipelinesFile};
use tidemark_etl::metadata::{MetadataRepository, PgMetadataRepository, PipelineCheckpoint};
use tidemark_etl::sql::{create_pool, DbConfig};
use tidemark_etl::{Cli, Commands, EtlPipeline, EtlStatus, Orchestrator, ProcessingResult};
use tracing::error;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_config = log_config(cli.verbose, |name| std::env::var(name).ok());
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    match execute(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

/// Command-line defaults overridden by the `LOG_*` variables.
///
/// Invalid variables are reported and the defaults kept as a whole.
fn log_config(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> LogConfig {
    let defaults = LogConfig::builder()
        .level(if verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("tidemark")
        .filter_directives("sqlx=warn")
        .build();
    match defaults.clone().merge_with(lookup) {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Warning: ignoring LOG_* settings: {e}");
            defaults
        }
    }
}

/// Run the command; `Ok(false)` when some pipeline failed
async fn execute(cli: &Cli) -> anyhow::Result<bool> {
    let config = EtlConfig::from_env().context("Invalid ETL configuration")?;
    let pipelines = PipelinesFile::load(&cli.pipelines)?;

    let target = create_pool(&DbConfig::from_env(&config.database_url))
        .await
        .context("Failed to connect to the target database")?;
    let source = if config.source_database_url == config.database_url {
        target.clone()
    } else {
        create_pool(&DbConfig::from_env(&config.source_database_url))
            .await
            .context("Failed to connect to the source database")?
    };

    let repository = PgMetadataRepository::new(target.clone(), &config.schema)?;
    repository.ensure_schema().await?;
    let repository: Arc<dyn MetadataRepository> = Arc::new(repository);

    let mut orchestrator = Orchestrator::new("tidemark", &config.group_id, repository)
        .with_batch_size(config.batch_size)
        .with_init_timestamp(config.init_timestamp);
    for definition in &pipelines.pipelines {
        let pipeline: Arc<dyn EtlPipeline> = Arc::new(
            definition
                .build(&config, &source, &target)
                .with_context(|| format!("Failed to build pipeline '{}'", definition.name))?,
        );
        orchestrator = orchestrator.with_pipeline(pipeline);
    }

    let results = match &cli.command {
        Commands::Run { name } => vec![orchestrator.run(name).await?],
        Commands::RunAll => orchestrator.run_all().await,
        Commands::Rerun { delete_data } => orchestrator.rerun(*delete_data).await?,
        Commands::Status => {
            print_checkpoints(&orchestrator.status().await?, cli.json)?;
            return Ok(true);
        }
    };

    print_results(&results, cli.json)?;
    Ok(results.iter().all(|r| r.status != EtlStatus::Failed))
}

fn print_results(results: &[ProcessingResult], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Pipeline", "Status", "Rows", "Last processed", "Duration (ms)", "Error"]);
    for result in results {
        table.add_row(vec![
            result.pipeline_name.clone(),
            result.status.to_string(),
            result.rows_processed.to_string(),
            result.last_processed_at.to_rfc3339(),
            result.duration_ms.to_string(),
            result.error_message.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn print_checkpoints(checkpoints: &[PipelineCheckpoint], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(checkpoints)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Pipeline", "Status", "Last processed", "Last run", "Rows (last / total)", "Error"]);
    for checkpoint in checkpoints {
        table.add_row(vec![
            checkpoint.pipeline_name.clone(),
            checkpoint.status.to_string(),
            checkpoint.last_processed_at.to_rfc3339(),
            checkpoint.last_run_at.to_rfc3339(),
            format!("{} / {}", checkpoint.rows_processed, checkpoint.total_rows_processed),
            checkpoint.error_message.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tidemark_common::logging::LogFormat;

    fn env(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string())
    }

    #[test]
    fn log_variables_override_command_line_defaults() {
        let config = log_config(false, env(&[("LOG_LEVEL", "warn"), ("LOG_FORMAT", "json")]));
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Console);
    }

    #[test]
    fn invalid_log_variable_keeps_the_defaults() {
        let config = log_config(true, env(&[("LOG_FORMAT", "json"), ("LOG_LEVEL", "loud")]));
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::default());
    }
}
