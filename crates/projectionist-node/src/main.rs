//! Projectionist - projector serial port to MQTT daemon
//!
//! This binary runs the projector bridge:
//! - Connects to the MQTT broker and waits for the first connection
//! - Opens the projector's serial port
//! - Relays status and commands until SIGINT/SIGTERM or a fatal error
//!
//! Exit status follows sysexits: 78 for configuration problems, 74 for
//! device or queue failures.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use projectionist_bridge::{
    list_available_ports, BridgeError, BusTransport, MqttTransport, ProjectionistConfig,
    ProjectorBridge, SerialInterface,
};

/// EX_IOERR
const EXIT_IO_ERROR: u8 = 74;

/// EX_CONFIG
const EXIT_CONFIG_ERROR: u8 = 78;

/// Pause between opening the port and the first frame
const DEVICE_SETTLE_TIME: Duration = Duration::from_millis(200);

/// How long to wait for the MQTT event loop after disconnecting
const MQTT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "projectionist")]
#[command(about = "Bridge a serially controlled projector to MQTT")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(long, short = 'f', default_value = "config.toml")]
    config_file: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.list_ports {
        return list_ports();
    }

    match run(&args).await {
        Ok(()) => {
            info!("Projectionist stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Projectionist failed: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map a top-level error to a process exit status
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<BridgeError>() {
        Some(e) if e.is_config_error() => EXIT_CONFIG_ERROR,
        Some(_) => EXIT_IO_ERROR,
        None => 1,
    }
}

fn list_ports() -> ExitCode {
    match list_available_ports() {
        Ok(ports) if ports.is_empty() => {
            println!("No serial ports found");
            ExitCode::SUCCESS
        }
        Ok(ports) => {
            for port in ports {
                println!("{port}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to enumerate serial ports");
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = ProjectionistConfig::load(&args.config_file)?;
    info!(
        config = %args.config_file.display(),
        broker = %config.mqtt.hostname,
        port = %config.serial.port.display(),
        "Starting Projectionist {}",
        projectionist_bridge::VERSION
    );

    let (bridge, handle) = ProjectorBridge::new(config.clone());
    let (mqtt, events) = MqttTransport::start(&config, handle.callbacks());

    info!("Waiting for MQTT connection");
    tokio::select! {
        _ = handle.wait_connected() => {}
        signal = shutdown_signal() => {
            signal.context("Failed to listen for signals")?;
            info!("Shutdown before MQTT connected");
            mqtt.disconnect().await?;
            return Ok(());
        }
    }

    let serial = SerialInterface::from_config(&config.serial);
    let (reader, writer) = match serial.open() {
        Ok(halves) => halves,
        Err(e) => {
            // Close the bus politely; the last will covers the rest
            let _ = mqtt.disconnect().await;
            return Err(e.into());
        }
    };
    tokio::time::sleep(DEVICE_SETTLE_TIME).await;

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                let _ = signal_handle.shutdown().await;
            }
            Err(e) => warn!(error = %e, "Failed to listen for signals"),
        }
    });

    let result = bridge.run(reader, writer, Arc::new(mqtt)).await;

    if tokio::time::timeout(MQTT_DRAIN_TIMEOUT, events).await.is_err() {
        warn!("MQTT event loop did not stop in time");
    }

    Ok(result?)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C, initiating shutdown");
    }

    Ok(())
}
