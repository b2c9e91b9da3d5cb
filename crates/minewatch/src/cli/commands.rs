//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Foreground pipeline arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Disable the HTTP snapshot server
    #[arg(long)]
    pub no_server: bool,

    /// Disable the simulation fallback (stale helmets drop out of snapshots)
    #[arg(long)]
    pub no_simulation: bool,
}

/// Test publisher arguments.
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Helmet to publish for (repeatable; defaults to the roster)
    #[arg(long = "helmet", value_name = "ID")]
    pub helmets: Vec<String>,

    /// Delay between rounds, in milliseconds
    #[arg(short, long, default_value = "2000")]
    pub interval_ms: u64,

    /// Number of rounds to publish (0 publishes until Ctrl-C)
    #[arg(short = 'n', long, default_value = "0")]
    pub count: u64,

    /// Seed for the synthetic values
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Classify command arguments.
#[derive(Debug, Args)]
pub struct ClassifyCommand {
    /// A telemetry payload, e.g. '{"helmet_id":"HELMET_001","co2":900,...}'
    pub payload: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Fail if the model delegate errors instead of falling back to thresholds
    #[arg(long)]
    pub strict: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
