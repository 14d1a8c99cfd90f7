// ABOUTME: Command implementations for the cdc-replicator CLI
// ABOUTME: Exports the watermark and config subcommands

pub mod config;
pub mod watermark;

pub use config::ConfigArgs;
pub use watermark::WatermarkArgs;
