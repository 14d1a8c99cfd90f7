// ABOUTME: Library root for cdc-replicator
// ABOUTME: Exposes the CDC reader core, configuration and CLI commands

pub mod cdc;
pub mod commands;
pub mod config;
