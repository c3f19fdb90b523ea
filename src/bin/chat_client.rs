//! Chat Client - console client for the chat relay

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_relay::client::run_console;
use chat_relay::protocol::DEFAULT_SERVER_ADDR;

/// CLI arguments for the console client
#[derive(Parser, Debug)]
#[command(name = "chat-client")]
#[command(about = "Console client for the chat relay")]
#[command(version)]
pub struct CliArgs {
    /// Relay server address
    #[arg(short, long, default_value = DEFAULT_SERVER_ADDR, help = "Server address")]
    pub server: String,

    /// Display name; prompted for when omitted
    #[arg(short, long, help = "Display name")]
    pub name: Option<String>,

    /// Log level for client diagnostics (written to stderr)
    #[arg(long, default_value = "warn", help = "Log level")]
    pub log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(env_filter)
        .init();

    let addr: SocketAddr = args
        .server
        .parse()
        .with_context(|| format!("Invalid server address: {}", args.server))?;

    run_console(addr, args.name).await
}
