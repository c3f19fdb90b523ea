//! Chat Relay - multi-client text relay server

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_relay::{config::ConfigManager, RelayServer, ShutdownCoordinator};

/// CLI arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(about = "Chat Relay - multi-client text relay server")]
#[command(version)]
#[command(long_about = "
Chat Relay - multi-client text relay server

Clients send their display name as the first line, then every line they
send is forwarded to all other connected clients as \"<name>: <line>\".

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CHAT_RELAY_BIND_ADDR          - Bind address (e.g., 0.0.0.0:54000)
  CHAT_RELAY_MAX_CONNECTIONS    - Maximum concurrent connections
  CHAT_RELAY_MAX_LINE_LENGTH    - Maximum line length in bytes (e.g., 4096)
  CHAT_RELAY_MAX_NAME_LENGTH    - Maximum display name length (e.g., 32)
  CHAT_RELAY_HANDSHAKE_TIMEOUT  - Time allowed to send a name (e.g., 30s)
  CHAT_RELAY_WRITE_TIMEOUT      - Per-recipient write timeout (e.g., 5s)
  CHAT_RELAY_SHUTDOWN_TIMEOUT   - Time allowed for sessions to close (e.g., 10s)
  CHAT_RELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "chat-relay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 0.0.0.0:54000)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Maximum number of concurrent connections
    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    let log_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };
    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.max_connections,
        log_level,
    );

    init_tracing(&config.logging.level);

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Max line length: {} bytes", config.server.max_line_length);
        info!("  Handshake timeout: {:?}", config.server.handshake_timeout);
        info!("  Write timeout: {:?}", config.server.write_timeout);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!("Starting chat-relay v{}", env!("CARGO_PKG_VERSION"));

    let shutdown_coordinator = ShutdownCoordinator::new();
    let mut server = RelayServer::new(Arc::new(config));
    server.bind().await?;
    let server = Arc::new(server);

    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
            }
        })
    };

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.shutdown_server(&server).await?;

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
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
}
