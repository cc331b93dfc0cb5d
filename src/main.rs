//! FaultRelay - Fault-Injecting TCP Relay
//!
//! Standalone relay binary. Sits between a client and a target endpoint,
//! forwards bytes in both directions, and can be told to silently drop the
//! target-to-client direction so that in-flight responses are lost. Useful
//! for reproducing retry-induced duplication against brokers and other
//! request/response servers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faultrelay::{config::ConfigManager, Relay, ShutdownCoordinator};

/// CLI arguments for FaultRelay
#[derive(Parser, Debug)]
#[command(name = "faultrelay")]
#[command(about = "Fault-injecting TCP relay")]
#[command(version)]
#[command(long_about = "
FaultRelay - Fault-Injecting TCP Relay

Relays TCP traffic between clients and a target endpoint. The target-to-client
direction can be put into drop mode, where received bytes are discarded
instead of forwarded; responses that arrive while dropped are lost for good.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  FAULTRELAY_LISTEN_PORT        - Listen port (0 = any free port)
  FAULTRELAY_TARGET_HOST        - Target host to forward to
  FAULTRELAY_TARGET_PORT        - Target port to forward to
  FAULTRELAY_BUFFER_SIZE        - Pump buffer size in bytes
  FAULTRELAY_DROP_POLL_INTERVAL - Sleep between discarded reads (e.g. 20ms)
  FAULTRELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)

At runtime, SIGUSR1 engages drop mode and SIGUSR2 clears it.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listen port (overrides config file; 0 = any free port)
    #[arg(short, long, help = "Listen port (0 = any free port)")]
    pub listen_port: Option<u16>,

    /// Target host (overrides config file)
    #[arg(long, help = "Target host to forward to")]
    pub target_host: Option<String>,

    /// Target port (overrides config file)
    #[arg(long, help = "Target port to forward to")]
    pub target_port: Option<u16>,

    /// Pump buffer size in bytes
    #[arg(long, help = "Pump buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Start with drop mode already engaged
    #[arg(long, help = "Start with upstream drop mode engaged")]
    pub blocked: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting FaultRelay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(
        args.listen_port,
        args.target_host.as_deref(),
        args.target_port,
        args.buffer_size,
        args.blocked,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen port: {} (0 = any free port)", config.listener.port);
        info!("  Target: {}:{}", config.target.host, config.target.port);
        info!("  Buffer size: {} bytes", config.relay.buffer_size);
        info!(
            "  Drop poll interval: {:?}",
            config.relay.drop_poll_interval
        );
        info!("  Shutdown timeout: {:?}", config.relay.shutdown_timeout);
        info!("  Start blocked: {}", config.relay.start_blocked);
        return Ok(());
    }

    let relay = Arc::new(Relay::from_config(&config));
    relay.start().await.context("Failed to start relay")?;

    match relay.listen_port() {
        Some(port) => info!(
            "FaultRelay ready: port {} -> {}:{}",
            port, config.target.host, config.target.port
        ),
        None => warn!("Relay started but listen port is not known"),
    }
    if relay.is_blocked() {
        warn!("Upstream drop mode is engaged from the start");
    }

    let shutdown_coordinator = ShutdownCoordinator::new();

    // Runtime control surface: SIGUSR1 engages drop mode, SIGUSR2 clears it
    #[cfg(unix)]
    let toggle_handle = spawn_toggle_listener(Arc::clone(&relay), shutdown_coordinator.subscribe());

    info!("Send SIGTERM or SIGINT to shut down gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    relay.stop().await;

    #[cfg(unix)]
    if let Err(e) = toggle_handle.await {
        if !e.is_cancelled() {
            error!("Drop mode toggle task failed: {}", e);
        }
    }

    info!("Relay shutdown complete");

    Ok(())
}

/// Listen for SIGUSR1/SIGUSR2 and toggle drop mode accordingly
#[cfg(unix)]
fn spawn_toggle_listener(
    relay: Arc<Relay>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut engage = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGUSR1 handler: {}", e);
                return;
            }
        };
        let mut clear = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGUSR2 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = engage.recv() => {
                    relay.set_blocked(true);
                    info!("SIGUSR1: drop mode engaged (blocked = {})", relay.is_blocked());
                }
                _ = clear.recv() => {
                    relay.set_blocked(false);
                    info!("SIGUSR2: drop mode cleared (blocked = {})", relay.is_blocked());
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
