// ABOUTME: `config check` subcommand - load and validate a replicator configuration

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::{self, ReplicatorConfig};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Validate a configuration file and print the effective settings
    Check {
        /// Path to the TOML file (default: ~/.cdc-replicator/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub async fn command(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Check { config: file } => {
            let path = match file {
                Some(path) => path,
                None => config::default_config_path()?,
            };
            let loaded = ReplicatorConfig::load(&path)?;
            println!("Configuration {} is valid.", path.display());
            print!("{}", loaded.summary());
        }
    }
    Ok(())
}
