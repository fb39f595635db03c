//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Steward - marketplace subscription lifecycle manager.
#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the lifecycle scheduler (foreground)
    Run(RunArgs),

    /// Run diagnostic checks
    #[command(subcommand)]
    Check(CheckCommand),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
}

/// Subcommands for `steward check`
#[derive(Subcommand, Debug)]
pub enum CheckCommand {
    /// Validate configuration (and the catalog it references)
    Config(ConfigPathArg),
}

#[derive(Parser, Debug)]
pub struct ConfigPathArg {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
}
