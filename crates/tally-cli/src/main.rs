//! Tally CLI - drive the KPI aggregation engine from JSON descriptors

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tally_connectors::{AggregationEngine, AggregationRequest, EngineConfig};
use tally_core::{Datasource, Indicator, IndicatorDataPoint, SyncMode, YearMonth};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "KPI aggregation - monthly indicator series from databases and files")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tables of a datasource
    Tables {
        /// Path to the datasource JSON file
        #[arg(short, long)]
        datasource: PathBuf,
    },

    /// Show rows of one table
    Rows {
        #[arg(short, long)]
        datasource: PathBuf,

        #[arg(short, long)]
        table: String,

        /// Maximum rows (0 = no cap, default TALLY_ROW_LIMIT)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Raw query: SQL for databases, a JSON filter for MongoDB
        #[arg(short, long)]
        query: Option<String>,
    },

    /// List tables and sample the first one
    Discover {
        #[arg(short, long)]
        datasource: PathBuf,
    },

    /// Compute the monthly series of an indicator
    Sync {
        #[arg(short, long)]
        datasource: PathBuf,

        /// Path to the indicator JSON file
        #[arg(short, long)]
        indicator: PathBuf,

        /// Only the month of the latest record
        #[arg(long, conflicts_with_all = ["from", "to"])]
        preview: bool,

        /// Explicit range start (YYYY-MM-DD); ignores lastSyncedDate
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Explicit range end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Write the series here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = AggregationEngine::new(EngineConfig::from_env()?);

    match cli.command {
        Commands::Tables { datasource } => {
            let datasource: Datasource = load_json(&datasource)?;
            let tables = engine.list_tables(&datasource).await?;
            print_json(&tables)?;
        }
        Commands::Rows {
            datasource,
            table,
            limit,
            query,
        } => {
            let datasource: Datasource = load_json(&datasource)?;
            let rows = engine
                .table_rows(&datasource, &table, limit, query.as_deref())
                .await?;
            print_json(&rows)?;
        }
        Commands::Discover { datasource } => {
            let datasource: Datasource = load_json(&datasource)?;
            let snapshot = engine.discover(&datasource).await?;
            print_json(&snapshot)?;
        }
        Commands::Sync {
            datasource,
            indicator,
            preview,
            from,
            to,
            output,
        } => {
            let datasource: Datasource = load_json(&datasource)?;
            let indicator: Indicator = load_json(&indicator)?;
            let series = if from.is_some() || to.is_some() {
                let request = AggregationRequest {
                    datasource,
                    indicator,
                    from,
                    to,
                };
                engine.aggregate(&request).await?
            } else {
                let mode = if preview { SyncMode::Preview } else { SyncMode::Full };
                let series = engine.run(&datasource, &indicator, mode).await?;
                if mode == SyncMode::Full {
                    if let Some(next) = next_synced_date(&series) {
                        info!("Indicator '{}' can advance lastSyncedDate to {}", indicator.id, next);
                    }
                }
                series
            };
            info!("Computed {} data point(s)", series.len());
            match output {
                Some(path) => write_json(&path, &series)?,
                None => print_json(&series)?,
            }
        }
    }

    Ok(())
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

/// Last day of the newest month in a series.
fn next_synced_date(series: &[IndicatorDataPoint]) -> Option<NaiveDate> {
    series
        .iter()
        .map(|p| YearMonth::of(p.date.date_naive()))
        .max()
        .map(|m| m.last_day())
}
