//! event-courier command line
//!
//! Sends events through the SDK using a TOML configuration file, or validates that file.

use clap::{Parser, Subcommand};
use event_courier::config::SdkConfig;
use event_courier::observability::{init_default_logging, init_logging, LogFormat};
use event_courier::protocol::{EntityReference, EventMessage};
use event_courier::queue::DeliveryReceipt;
use event_courier::sdk::{EventSdk, ShutdownOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn, Level};

/// Reliable event delivery to an MQTT ingestion broker
#[derive(Parser)]
#[command(name = "event-courier")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "courier.toml")]
    config: PathBuf,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue events, wait for delivery, then exit
    Send {
        #[arg(long)]
        event_type: String,
        #[arg(long)]
        entity_id: String,
        /// Number of copies to send
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
        /// Give up waiting for delivery after this many seconds
        #[arg(long, env = "COURIER_DRAIN_TIMEOUT_SECS")]
        drain_timeout_secs: Option<u64>,
    },
    /// Validate the configuration file
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Send {
            event_type,
            entity_id,
            count,
            data,
            drain_timeout_secs,
        } => {
            send_events(
                config,
                &event_type,
                &entity_id,
                count,
                &data,
                drain_timeout_secs.map(Duration::from_secs),
            )
            .await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: &Path) -> Result<SdkConfig, Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", path.display());
    Ok(SdkConfig::load_from_file(path)?)
}

async fn send_events(
    config: SdkConfig,
    event_type: &str,
    entity_id: &str,
    count: u32,
    data: &str,
    drain_timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let data: serde_json::Value = serde_json::from_str(data)?;
    let sdk = EventSdk::from_config(&config)?;

    let mut events = sdk.subscribe()?;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "Connection event");
        }
    });

    sdk.start().await?;

    let delivered = Arc::new(AtomicU64::new(0));
    for _ in 0..count {
        let message = EventMessage::new(event_type, data.clone())
            .with_entity(EntityReference::new(entity_id));
        let delivered = delivered.clone();
        sdk.send_message(
            message,
            Some(Box::new(move |receipt: &DeliveryReceipt| {
                delivered.fetch_add(1, Ordering::Relaxed);
                info!(message_id = %receipt.message_id, topic = %receipt.topic, "Delivered");
            })),
        )?;
    }
    info!(count, "Events queued");

    tokio::select! {
        report = sdk.stop(ShutdownOptions::drain(drain_timeout)) => {
            let report = report?;
            if report.timed_out {
                warn!(pending = report.pending, "Exiting with undelivered events");
            }
        }
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping without waiting for delivery");
        }
    }
    sdk.dispose().await?;

    info!(
        delivered = delivered.load(Ordering::Relaxed),
        requested = count,
        "Done"
    );
    Ok(())
}

fn handle_config_command(config: &SdkConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration is valid");
    Ok(())
}
