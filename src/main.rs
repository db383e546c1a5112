//! Strategy margin tool
//!
//! Derives the margin a trading strategy requires from its latest
//! configuration and backfills the result into the strategy store.

mod db;
mod margin;
mod migration;
mod models;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::db::{Database, StrategyRepository};
use crate::margin::MarginCalculator;
use crate::migration::{BackfillConfig, MarginBackfill};
use crate::models::{InstrumentKind, MarginResult, RiskProfile, StrategyConfig};

/// Strategy margin CLI.
#[derive(Parser)]
#[command(name = "strategy-margin")]
#[command(about = "Derive and backfill margin requirements for trading strategies", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./strategies.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive margin fields for every stored strategy and write them back
    Backfill {
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Skip strategies that already have margin fields
        #[arg(long)]
        only_missing: bool,

        /// Seconds to keep retrying a failing write
        #[arg(long, default_value = "10")]
        retry_window_secs: u64,
    },

    /// Calculate margin for a single configuration
    Calc {
        /// Traded pair (a "B-" prefix marks futures)
        #[arg(short, long)]
        pair: Option<String>,

        /// Instrument identifier, used when no pair is given
        #[arg(short, long)]
        instrument: Option<String>,

        /// Recommended capital
        #[arg(short, long)]
        capital: Option<Decimal>,

        /// Leverage multiplier
        #[arg(short = 'x', long)]
        leverage: Option<Decimal>,

        /// Full configuration as JSON (overrides the other flags)
        #[arg(long)]
        json: Option<String>,
    },

    /// Import strategies and configuration snapshots from a JSON file
    Import {
        /// File holding a JSON array of {id?, name, config}
        file: PathBuf,
    },

    /// List stored strategies with their margin fields
    List,

    /// Show how many strategies have margin fields
    Status,
}

/// One entry of an import file.
#[derive(Debug, Deserialize)]
struct StrategySeed {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

/// `calc --json` output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CalcOutput<'a> {
    instrument: &'a str,
    kind: InstrumentKind,
    #[serde(flatten)]
    result: MarginResult,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Calc {
            pair,
            instrument,
            capital,
            leverage,
            json,
        } => {
            let (config, as_json) = match json {
                Some(raw) => (
                    StrategyConfig::from_json(&raw).context("Invalid configuration JSON")?,
                    true,
                ),
                None => {
                    let risk_profile = if capital.is_some() || leverage.is_some() {
                        Some(RiskProfile {
                            recommended_capital: capital,
                            leverage,
                        })
                    } else {
                        None
                    };
                    (
                        StrategyConfig {
                            pair,
                            instrument,
                            risk_profile,
                        },
                        false,
                    )
                }
            };

            let result = MarginCalculator::calculate(&config);

            if as_json {
                let output = CalcOutput {
                    instrument: config.instrument_id(),
                    kind: InstrumentKind::classify(config.instrument_id()),
                    result,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Instrument:       {}", display_or_dash(config.instrument_id()));
                println!("Margin Currency:  {}", result.margin_currency);
                println!(
                    "Margin Required:  {}",
                    result
                        .margin_required
                        .map(|m| m.normalize().to_string())
                        .unwrap_or_else(|| "unset".to_string())
                );
            }
        }

        Commands::Backfill {
            dry_run,
            only_missing,
            retry_window_secs,
        } => {
            let db = Database::new(&cli.database).await?;

            let config = BackfillConfig {
                dry_run,
                only_missing,
                write_retry_window: Duration::from_secs(retry_window_secs),
                ..Default::default()
            };

            let backfill = MarginBackfill::new(db, config);
            let report = backfill.run().await?;
            println!("\n{}", report);

            let stats = backfill.repository().margin_stats().await?;
            println!(
                "Store now has {} of {} strategies with margin fields",
                stats.with_margin, stats.total
            );

            if !report.is_success() {
                anyhow::bail!("{} strategies failed to update", report.failed());
            }
        }

        Commands::Import { file } => {
            let db = Database::new(&cli.database).await?;

            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let seeds: Vec<StrategySeed> = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid import file {}", file.display()))?;

            info!(file = %file.display(), strategies = seeds.len(), "Importing strategies");

            let (strategies, snapshots) = import_seeds(&db, &seeds).await?;

            println!(
                "Imported {} strategies ({} config snapshots)",
                strategies, snapshots
            );
        }

        Commands::List => {
            let db = Database::new(&cli.database).await?;
            let strategies = db.list_all().await?;

            if strategies.is_empty() {
                println!("No strategies stored. Use 'strategy-margin import <file>' to add some.");
                return Ok(());
            }

            println!(
                "\n{:<38} {:<24} {:>14} {:>8} {:>8}",
                "ID", "NAME", "MARGIN", "CCY", "CONFIGS"
            );
            println!("{}", "-".repeat(96));

            for strategy in &strategies {
                let configs = db.config_count(&strategy.id).await?;
                println!(
                    "{:<38} {:<24} {:>14} {:>8} {:>8}",
                    truncate(&strategy.id, 38),
                    truncate(strategy.display_name(), 22),
                    strategy
                        .margin_required
                        .map(|m| m.normalize().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    strategy
                        .margin_currency
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    configs
                );
            }
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let stats = db.margin_stats().await?;

            println!("\n=== Strategy Margin Status ===");
            println!("Strategies:       {}", stats.total);
            println!("With Margin:      {}", stats.with_margin);
            println!("Without Margin:   {}", stats.without_margin);
        }
    }

    Ok(())
}

/// Store seeds, returning how many strategies and snapshots were written.
///
/// Seeds without an id get a fresh UUID; every seed with a config appends a
/// new snapshot version.
async fn import_seeds(db: &Database, seeds: &[StrategySeed]) -> Result<(usize, usize)> {
    let mut snapshots = 0;

    for seed in seeds {
        let id = seed
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        db.upsert_strategy(&id, &seed.name).await?;

        if let Some(config) = &seed.config {
            let version = db.add_config_snapshot(&id, config).await?;
            snapshots += 1;
            tracing::debug!(strategy = %id, version = version, "Stored config snapshot");
        }
    }

    Ok((seeds.len(), snapshots))
}

fn display_or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
