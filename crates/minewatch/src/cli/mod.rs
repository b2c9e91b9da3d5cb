//! Command-line interface for minewatch.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ClassifyCommand, ConfigCommand, PublishCommand, RunCommand};

use crate::logging::Verbosity;

/// minewatch - real-time helmet telemetry for underground mines
///
/// Subscribes to helmet sensor readings over MQTT, falls back to simulated
/// data for helmets that go quiet, classifies risk and serves snapshots to
/// the dashboard.
#[derive(Debug, Parser)]
#[command(name = "minewatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the telemetry pipeline in the foreground
    Run(RunCommand),

    /// Publish synthetic helmet readings to the broker
    Publish(PublishCommand),

    /// Classify a single telemetry payload
    Classify(ClassifyCommand),

    /// View or check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli(verbose: u8, quiet: bool) -> Cli {
        Cli {
            config: None,
            verbose,
            quiet,
            command: Command::Config(ConfigCommand::Path),
        }
    }

    #[test]
    fn test_cli_name() {
        assert_eq!(Cli::command().get_name(), "minewatch");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity() {
        assert_eq!(cli(0, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli(3, true).verbosity(), Verbosity::Quiet);
        assert_eq!(cli(0, false).verbosity(), Verbosity::Normal);
        assert_eq!(cli(1, false).verbosity(), Verbosity::Verbose);
        assert_eq!(cli(2, false).verbosity(), Verbosity::Trace);
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["minewatch", "run", "--no-server"]).unwrap();
        match cli.command {
            Command::Run(cmd) => {
                assert!(cmd.no_server);
                assert!(!cmd.no_simulation);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "minewatch",
            "publish",
            "--helmet",
            "HELMET_001",
            "--helmet",
            "HELMET_003",
            "--interval-ms",
            "500",
            "-n",
            "4",
        ])
        .unwrap();
        match cli.command {
            Command::Publish(cmd) => {
                assert_eq!(cmd.helmets, vec!["HELMET_001", "HELMET_003"]);
                assert_eq!(cmd.interval_ms, 500);
                assert_eq!(cmd.count, 4);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_publish_defaults() {
        let cli = Cli::try_parse_from(["minewatch", "publish"]).unwrap();
        match cli.command {
            Command::Publish(cmd) => {
                assert!(cmd.helmets.is_empty());
                assert_eq!(cmd.interval_ms, 2000);
                assert_eq!(cmd.count, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_classify() {
        let cli = Cli::try_parse_from(["minewatch", "classify", "{}", "--json"]).unwrap();
        match cli.command {
            Command::Classify(cmd) => {
                assert_eq!(cmd.payload, "{}");
                assert!(cmd.json);
                assert!(!cmd.strict);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_classify_strict() {
        let cli = Cli::try_parse_from(["minewatch", "classify", "{}", "--strict"]).unwrap();
        match cli.command {
            Command::Classify(cmd) => assert!(cmd.strict),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_validate() {
        let cli =
            Cli::try_parse_from(["minewatch", "config", "validate", "--file", "/tmp/x.toml"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Validate { file: Some(_) })
        ));
    }

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from(["minewatch", "-c", "/etc/minewatch.toml", "-vv", "config", "path"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/minewatch.toml")));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_missing_command_is_error() {
        assert!(Cli::try_parse_from(["minewatch"]).is_err());
    }
}
