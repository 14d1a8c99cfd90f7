// ABOUTME: `watermark` subcommand - inspect and edit the SQLite watermark store
// ABOUTME: list, get, set and reset per-table watermarks

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::cdc::table::TableKey;
use crate::cdc::timestamp::Timestamp;
use crate::cdc::watermark::{SqliteWatermarkStore, WatermarkRecord};
use crate::config::{self, ReplicatorConfig};

#[derive(Args)]
pub struct WatermarkArgs {
    /// Path to the watermark store (default: watermark.path of
    /// ~/.cdc-replicator/config.toml, else ~/.cdc-replicator/watermarks.db)
    #[arg(long, global = true, env = "CDC_REPLICATOR_STORE")]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: WatermarkCommands,
}

#[derive(Subcommand)]
enum WatermarkCommands {
    /// List every recorded table with its watermark and last error
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the watermark of one table
    Get {
        /// Table as db.table
        table: TableKey,
    },
    /// Set the watermark of one table (the replicator must not be running)
    Set {
        /// Table as db.table
        table: TableKey,
        /// Timestamp as physical-logical, e.g. 1700000000000-0
        ts: Timestamp,
    },
    /// Forget a table so the next run replays from the configured start
    Reset {
        /// Table as db.table
        table: TableKey,
    },
}

/// Store named by the default config file, if there is one.
fn configured_store_path() -> Result<PathBuf> {
    let config_path = config::default_config_path()?;
    if config_path.exists() {
        ReplicatorConfig::load(&config_path)?.watermark_path()
    } else {
        config::default_watermark_path()
    }
}

pub async fn command(args: WatermarkArgs) -> Result<()> {
    let path = match args.store {
        Some(path) => path,
        None => configured_store_path()?,
    };
    let store = SqliteWatermarkStore::open(&path)
        .with_context(|| format!("Failed to open watermark store {}", path.display()))?;

    match args.command {
        WatermarkCommands::List { json } => {
            let records = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No watermarks recorded in {}", path.display());
            } else {
                print_records(&records);
            }
        }
        WatermarkCommands::Get { table } => match store.get_persisted(&table)? {
            Some(record) => {
                println!("{}: {}", record.key, record.watermark);
                if let Some(err) = record.err_msg {
                    println!("last error: {}", err);
                }
            }
            None => bail!("No watermark recorded for {}", table),
        },
        WatermarkCommands::Set { table, ts } => {
            store.set(&table, ts)?;
            tracing::info!("Watermark of {} set to {}", table, ts);
            println!("Watermark of {} set to {}", table, ts);
        }
        WatermarkCommands::Reset { table } => {
            if store.remove(&table)? {
                println!("Watermark of {} removed.", table);
            } else {
                println!("No watermark recorded for {}.", table);
            }
        }
    }
    Ok(())
}

fn print_records(records: &[WatermarkRecord]) {
    let width = records
        .iter()
        .map(|r| r.key.qualified_name().len())
        .max()
        .unwrap_or(0)
        .max("TABLE".len());
    println!("{:<width$}  {:<24}  {:<19}  ERROR", "TABLE", "WATERMARK", "UPDATED");
    for record in records {
        println!(
            "{:<width$}  {:<24}  {:<19}  {}",
            record.key.qualified_name(),
            record.watermark.to_string(),
            record.updated_at,
            record.err_msg.as_deref().unwrap_or("-"),
        );
    }
}
