//! Connection Management Module
//!
//! Connection identity and lifecycle, and the registry of live connections.

pub mod registry;
pub mod types;

pub use registry::{ConnectionRegistry, Registration, RegistryEntry, Snapshot};
pub use types::{Connection, ConnectionId, ConnectionState, TransportHandle};
