//! Chat Relay Library
//!
//! A multi-client text relay: clients connect over TCP, send a display name
//! as their first line, then every line they send is forwarded to all other
//! connected clients.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use client::ChatClient;
pub use config::Config;
pub use connection::{ConnectionId, ConnectionRegistry};
pub use error::RelayError;
pub use relay::{BroadcastRelay, SessionHandler};
pub use server::RelayServer;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the application edges
pub type Result<T> = anyhow::Result<T>;
