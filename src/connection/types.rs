//! Connection Types

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::MessageWriter;

/// Opaque identity of one accepted transport stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no display name yet
    Connecting,
    /// Display name received, registration in progress
    Named,
    /// Registered and relaying messages
    Active,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Named)
                | (Connecting, Closed)
                | (Named, Active)
                | (Named, Closed)
                | (Active, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Named => "named",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One accepted transport stream with its session metadata
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    display_name: Option<String>,
    state: ConnectionState,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection in the `Connecting` state
    pub fn new(id: ConnectionId, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer_addr,
            display_name: None,
            state: ConnectionState::Connecting,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Display name, empty until the handshake completes
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("")
    }

    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Assign the display name; allowed exactly once
    pub fn set_display_name(&mut self, name: String) -> Result<(), RelayError> {
        if self.display_name.is_some() {
            return Err(RelayError::NameAlreadySet(self.id));
        }
        self.display_name = Some(name);
        Ok(())
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Illegal transitions leave the state untouched and return `None`.
    pub fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            debug!(connection_id = %self.id, from = %previous, to = %next, "Rejected state transition");
            return None;
        }
        self.state = next;
        debug!(connection_id = %self.id, from = %previous, to = %next, "State transition");
        Some(previous)
    }
}

/// Shared write side of one connection.
///
/// Clones refer to the same stream. Sends are serialized by an async mutex
/// so lines from concurrent broadcasts never interleave on the wire.
/// A failure is signalled through a cancellation token so the session that
/// owns the connection can wind it down.
#[derive(Clone)]
pub struct TransportHandle {
    id: ConnectionId,
    writer: Arc<Mutex<MessageWriter>>,
    failed: CancellationToken,
}

impl TransportHandle {
    pub fn new(id: ConnectionId, writer: MessageWriter) -> Self {
        Self {
            id,
            writer: Arc::new(Mutex::new(writer)),
            failed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether an earlier send on this handle failed
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves once a send on any clone of this handle has failed, or the
    /// transport was shut down
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    /// Send one message, bounded by `write_timeout`.
    ///
    /// After the first failure the handle stays failed: a timed-out write
    /// may have left a partial line in the stream.
    pub async fn send(&self, message: &str, write_timeout: Duration) -> Result<(), RelayError> {
        if self.is_failed() {
            return Err(self.delivery_failure("transport previously failed"));
        }

        let mut writer = self.writer.lock().await;
        let result = match timeout(write_timeout, writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.delivery_failure(&e.to_string())),
            Err(_) => Err(self.delivery_failure(&format!(
                "write timed out after {:?}",
                write_timeout
            ))),
        };

        if result.is_err() {
            self.failed.cancel();
        }
        result
    }

    /// Flush and close the write half
    pub async fn shutdown(&self, write_timeout: Duration) {
        self.failed.cancel();
        let mut writer = self.writer.lock().await;
        match timeout(write_timeout, SinkExt::<&str>::close(&mut *writer)).await {
            Ok(Ok(())) => debug!(connection_id = %self.id, "Transport closed"),
            Ok(Err(e)) => debug!(connection_id = %self.id, "Error closing transport: {}", e),
            Err(_) => debug!(connection_id = %self.id, "Timed out closing transport"),
        }
    }

    fn delivery_failure(&self, reason: &str) -> RelayError {
        RelayError::DeliveryFailure {
            id: self.id,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("failed", &self.is_failed())
            .finish()
    }
}
