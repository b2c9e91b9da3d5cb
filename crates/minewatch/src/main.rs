//! `minewatch` - CLI for the helmet telemetry pipeline.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::info;

use minewatch::cli::{ClassifyCommand, Cli, Command, ConfigCommand, PublishCommand, RunCommand};
use minewatch::codec;
use minewatch::delegate::{Assessor, CommandDelegate};
use minewatch::publisher::{self, PublishPlan};
use minewatch::{init_logging, Config, Pipeline, ShutdownHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    // `config validate` reports problems instead of failing on them.
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    // Invalid configuration is fatal before anything starts.
    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(cmd) => handle_run(config, &cmd).await,
        Command::Publish(cmd) => handle_publish(&config, cmd).await,
        Command::Classify(cmd) => handle_classify(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, &cmd),
    }
}

async fn handle_run(mut config: Config, cmd: &RunCommand) -> anyhow::Result<()> {
    if cmd.no_server {
        config.server.enabled = false;
    }
    if cmd.no_simulation {
        config.simulation.enabled = false;
    }

    let handle = Pipeline::start(&config).await?;
    if let Some(addr) = handle.local_addr() {
        info!("dashboard snapshots at http://{addr}/api/snapshot");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("received Ctrl-C");
    handle.shutdown().await;
    Ok(())
}

async fn handle_publish(config: &Config, cmd: PublishCommand) -> anyhow::Result<()> {
    let helmets = if cmd.helmets.is_empty() {
        config.roster_ids()
    } else {
        cmd.helmets
    };
    anyhow::ensure!(!helmets.is_empty(), "no helmets to publish for");

    let plan = PublishPlan {
        helmets,
        interval: std::time::Duration::from_millis(cmd.interval_ms),
        rounds: (cmd.count > 0).then_some(cmd.count),
        seed: cmd.seed,
    };

    let shutdown = ShutdownHandle::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.stop();
        }
    });

    let sent = publisher::publish(config, &plan, shutdown).await?;
    println!("Published {sent} messages to {}", config.broker.topic);
    Ok(())
}

async fn handle_classify(config: &Config, cmd: &ClassifyCommand) -> anyhow::Result<()> {
    let reading = codec::decode(&config.broker.topic, cmd.payload.as_bytes(), Utc::now())?;

    let mut assessor = Assessor::new(config.thresholds.clone());
    if config.delegate.enabled {
        assessor = assessor.with_delegate(std::sync::Arc::new(CommandDelegate::from_config(
            &config.delegate,
        )));
    }
    let assessment = if cmd.strict {
        assessor
            .assess_strict(&reading)
            .await
            .context("model delegate failed")?
    } else {
        assessor.assess(&reading).await
    };

    if cmd.json {
        let output = serde_json::json!({
            "reading": reading,
            "assessment": assessment,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Helmet:  {}", reading.helmet_id);
    println!("Time:    {}", reading.timestamp.to_rfc3339());
    println!("Risk:    {}", assessment.level);
    if let Some(label) = &assessment.model_label {
        println!("Model:   {label}");
    }
    println!();
    for (dimension, level) in &assessment.dimensions {
        println!(
            "  {:<9} {:>10.2} {:<4} {}",
            dimension.field(),
            reading.values.get(*dimension),
            dimension.unit(),
            level
        );
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json: true } => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigCommand::Show { json: false } => {
            println!("Current Configuration");
            println!("=====================");
            println!();
            println!("[Broker]");
            println!("  Address:            {}:{}", config.broker.host, config.broker.port);
            println!("  Topic:              {}", config.broker.topic);
            println!("  Client id:          {}", config.broker.client_id);
            println!("  Reconnect backoff:  {}ms", config.broker.reconnect_backoff_ms);
            println!();
            println!("[Pipeline]");
            println!("  Tick interval:      {}ms", config.pipeline.tick_interval_ms);
            println!("  Staleness window:   {}ms", config.pipeline.staleness_window_ms);
            println!("  History capacity:   {}", config.pipeline.history_capacity);
            println!("  Max helmets:        {}", config.pipeline.max_helmets);
            println!("  Roster:");
            for entry in &config.pipeline.roster {
                let miner = entry.miner.as_deref().unwrap_or("-");
                let location = entry.location.as_deref().unwrap_or("-");
                println!("    {:<12} {:<16} {}", entry.id, miner, location);
            }
            println!();
            println!("[Simulation]");
            println!("  Enabled:            {}", config.simulation.enabled);
            println!();
            println!("[Delegate]");
            println!("  Enabled:            {}", config.delegate.enabled);
            if config.delegate.enabled {
                println!("  Command:            {}", config.delegate.command);
            }
            println!();
            println!("[Server]");
            println!("  Enabled:            {}", config.server.enabled);
            println!("  Bind address:       {}", config.server.bind_addr);
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            return handle_validate(file.clone());
        }
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {e}");
            anyhow::bail!("configuration is invalid")
        }
    }
}
