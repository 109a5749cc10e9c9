//! Command-line entry point for GridMind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridmind_core::config::{env_flag, env_vars, resolve_config_path, LoggingConfig};
use gridmind_runtime::{GridConfig, GridRuntime};

/// GridMind - power telemetry, anomaly detection and load optimization.
#[derive(Parser, Debug)]
#[command(name = "gridmind")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to $GRIDMIND_CONFIG, then ./gridmind.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start every service and run until Ctrl-C.
    Run,
    /// Run one discovery pass and print what was found.
    Discover {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = resolve_config_path(args.config.as_deref());
    let (config, defaulted) = load_config(&path, args.config.is_some())?;
    init_logging(&config.logging);
    if defaulted {
        tracing::warn!(path = %path.display(), "Configuration file not found, using defaults");
    }

    match args.command {
        Command::Run => run(config).await,
        Command::Discover { json } => discover(config, json).await,
        Command::CheckConfig => check_config(&config, &path),
    }
}

/// An explicit `--config` must exist; the implicit default may be absent.
fn load_config(path: &Path, explicit: bool) -> Result<(GridConfig, bool)> {
    if !explicit && !path.exists() {
        return Ok((GridConfig::default(), true));
    }
    let config = GridConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    Ok((config, false))
}

fn init_logging(logging: &LoggingConfig) {
    let json_logging = logging.json || env_flag(env_vars::LOG_JSON);

    // RUST_LOG wins over the configured level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run(config: GridConfig) -> Result<()> {
    let runtime = GridRuntime::build(config)?;
    runtime.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    runtime.shutdown().await;
    tracing::info!("GridMind stopped");
    Ok(())
}

async fn discover(config: GridConfig, json: bool) -> Result<()> {
    let runtime = GridRuntime::build(config)?;
    let report = runtime.discover().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.devices)?);
    } else {
        println!("{:<24} {:<12} {:<12} {}", "ID", "TYPE", "PROTOCOL", "NAME");
        for device in &report.devices {
            println!(
                "{:<24} {:<12} {:<12} {}",
                device.id, device.device_type, device.protocol, device.name
            );
        }
        println!(
            "\n{} device(s) in {:.1}s",
            report.devices.len(),
            report.duration.as_secs_f64()
        );
    }
    for error in &report.errors {
        eprintln!("warning: {}", error);
    }
    Ok(())
}

fn check_config(config: &GridConfig, path: &Path) -> Result<()> {
    config.validate()?;
    println!("Configuration OK: {}", path.display());
    println!("  storage:        {:?} ({})", config.storage.backend, config.storage.path.display());
    println!("  static devices: {}", config.devices.len());
    println!("  subnets:        {}", config.discovery.subnets.len());
    println!(
        "  listener:       {}",
        if config.listener.enabled {
            config.listener.bind.as_str()
        } else {
            "disabled"
        }
    );
    println!("  anomaly:        {}", enabled(config.anomaly.enabled));
    println!(
        "  optimizer:      {} ({} rules)",
        enabled(config.optimizer.enabled),
        config.optimizer.initial_rules().len()
    );
    println!(
        "  load balancing: {} ({:?})",
        enabled(config.load_balancing.enabled),
        config.load_balancing.strategy
    );
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}
