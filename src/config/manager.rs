//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;

/// Prefix of the environment variables read by `load_from_env`
pub const ENV_PREFIX: &str = "CHAT_RELAY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults if it is missing
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration from environment variables over the defaults
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Apply `CHAT_RELAY_*` variables from `lookup` over the defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Config::default();

        if let Some(bind_addr) = var("BIND_ADDR") {
            config.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid {}BIND_ADDR: {}", ENV_PREFIX, bind_addr))?;
        }

        if let Some(max_conn) = var("MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid {}MAX_CONNECTIONS: {}", ENV_PREFIX, max_conn))?;
        }

        if let Some(length) = var("MAX_LINE_LENGTH") {
            config.server.max_line_length = length
                .parse::<usize>()
                .with_context(|| format!("Invalid {}MAX_LINE_LENGTH: {}", ENV_PREFIX, length))?;
        }

        if let Some(length) = var("MAX_NAME_LENGTH") {
            config.server.max_name_length = length
                .parse::<usize>()
                .with_context(|| format!("Invalid {}MAX_NAME_LENGTH: {}", ENV_PREFIX, length))?;
        }

        if let Some(timeout) = var("HANDSHAKE_TIMEOUT") {
            config.server.handshake_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}HANDSHAKE_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(timeout) = var("WRITE_TIMEOUT") {
            config.server.write_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}WRITE_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(timeout) = var("SHUTDOWN_TIMEOUT") {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid {}SHUTDOWN_TIMEOUT: {}", ENV_PREFIX, timeout))?;
        }

        if let Some(log_level) = var("LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if server.max_connections > 100_000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if server.max_line_length < 64 {
            bail!("max_line_length must be at least 64 bytes");
        }

        if server.max_line_length > 1_048_576 {
            bail!("max_line_length cannot exceed 1MB");
        }

        if server.max_name_length == 0 {
            bail!("max_name_length must be greater than 0");
        }

        if server.max_name_length > server.max_line_length {
            bail!("max_name_length cannot exceed max_line_length");
        }

        if server.handshake_timeout.is_zero() {
            bail!("handshake_timeout must be greater than 0");
        }

        if server.write_timeout.is_zero() {
            bail!("write_timeout must be greater than 0");
        }

        if server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        max_connections: Option<usize>,
        log_level: Option<&str>,
    ) {
        if let Some(bind_str) = bind {
            if let Ok(addr) = bind_str.parse::<SocketAddr>() {
                self.server.bind_addr = addr;
                tracing::info!("CLI override: bind address set to {}", addr);
            } else {
                tracing::warn!("Invalid bind address provided: {}", bind_str);
            }
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}
