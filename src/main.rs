//! rtl433-mqtt - Main Entry Point
//!
//! Reads newline-delimited JSON event records (`rtl_433 -F json`) from stdin
//! and publishes them to an MQTT broker.

use clap::{Parser, Subcommand};
use rtl433_mqtt::observability::init_default_logging;
use rtl433_mqtt::{build_relay, RelayConfig, RelayResult};
use std::path::{Path, PathBuf};
use std::process;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["rtl433-mqtt.toml", "config/rtl433-mqtt.toml"];

/// Publish rtl_433 JSON events to MQTT
#[derive(Parser)]
#[command(name = "rtl433-mqtt")]
#[command(about = "Publish rtl_433 sensor events to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Output option string: [mqtt[s]://]host[:port][,key[=value]]...
    #[arg(value_name = "OUTPUT")]
    output: Option<String>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hostname to use in topics and the client id
    #[arg(long, env = "RTL433_MQTT_HOSTNAME")]
    hostname: Option<String>,

    /// Receiver device hint, folded into the client id
    #[arg(long, value_name = "HINT")]
    device_hint: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay stdin to the broker (default)
    Run,
    /// Validate the configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose);

    info!("Starting rtl433-mqtt v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        if e.is_startup_error() {
            error!("Startup failed: {}", e);
        } else {
            error!("Command failed: {}", e);
        }
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(cli: &Cli) -> RelayResult<RelayConfig> {
    let mut config = match config_path(cli.config.as_deref()) {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            RelayConfig::load_from_file(&path)?
        }
        None => RelayConfig::default(),
    };

    if let Some(hostname) = &cli.hostname {
        config.relay.hostname = Some(hostname.clone());
    }
    if let Some(hint) = &cli.device_hint {
        config.relay.device_hint = Some(hint.clone());
    }
    if let Some(output) = &cli.output {
        config.apply_output(output)?;
    }
    Ok(config)
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

async fn run_relay(config: RelayConfig) -> RelayResult<()> {
    let mut relay = build_relay(&config)?;
    let input = BufReader::new(tokio::io::stdin());

    let summary = relay.run(input, shutdown_signal()).await?;
    info!(
        "Relayed {} records as {} publications, {} rejected, {} dropped",
        summary.records, summary.publications, summary.rejected, summary.dropped
    );
    Ok(())
}

fn handle_config_command(config: &RelayConfig, show: bool) -> RelayResult<()> {
    let hostname = config.hostname()?;
    let topics = config.topics(&hostname)?;
    let options = config.connection_options(&hostname)?;

    if show {
        println!("# Resolved configuration");
        println!("{}", config.to_toml()?);
        println!("# broker:    {}", options.address);
        println!("# client id: {}", options.client_id);
        for (channel, template) in [
            ("devices", &topics.devices),
            ("events", &topics.events),
            ("states", &topics.states),
        ] {
            match template {
                Some(template) => println!("# {channel:<9}  {template}"),
                None => println!("# {channel:<9}  (disabled)"),
            }
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
