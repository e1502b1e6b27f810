mod commands;
mod output;

use anyhow::Result;
use assayer_analysis::tables::{Dimension, MetricField};
use assayer_common::config::EvalConfig;
use clap::{Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "assayer-cli")]
#[command(about = "Assayer CLI - Register candidates, merge stage logs and score results", long_about = None)]
struct Cli {
    /// Pipeline config (defaults to $ASSAYER_CONFIG or config/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record generation entries for candidate programs found under codes_dir
    Register,

    /// Merge per-stage logs into merged/merged_results.ndjson
    Merge,

    /// Compute FC, R, RB, M, S, HR and CQS per candidate
    Metrics {
        /// Score invalid records too
        #[arg(long, default_value = "false")]
        include_invalid: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,

        /// Also write metric records as NDJSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print error-type distributions and a metric pivot table
    Tables {
        /// Metric to pivot (fc, r, rb, m, s, hr, cqs)
        #[arg(short, long, default_value = "cqs")]
        metric: MetricField,

        /// Row dimension (model, language, completeness, task)
        #[arg(short, long, default_value = "model")]
        by: Dimension,

        /// Score invalid records too
        #[arg(long, default_value = "false")]
        include_invalid: bool,
    },

    /// Correlate metrics with task complexity, language and prompt completeness
    Correlation {
        /// Write per-dimension metric means and the correlation table as CSV here
        #[arg(short, long)]
        export_dir: Option<PathBuf>,

        /// Score invalid records too
        #[arg(long, default_value = "false")]
        include_invalid: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EvalConfig::load(path)?,
        None => EvalConfig::load_default()?,
    };

    match cli.command {
        Commands::Register => {
            commands::register(&config).await?;
        }
        Commands::Merge => {
            commands::merge(&config)?;
        }
        Commands::Metrics {
            include_invalid,
            format,
            output,
        } => {
            commands::metrics(&config, include_invalid, format, output.as_deref())?;
        }
        Commands::Tables {
            metric,
            by,
            include_invalid,
        } => {
            commands::tables(&config, metric, by, include_invalid)?;
        }
        Commands::Correlation {
            export_dir,
            include_invalid,
        } => {
            commands::correlation(&config, include_invalid, export_dir.as_deref())?;
        }
    }

    Ok(())
}
