//! Relay Server
//!
//! Accepts TCP connections and spawns one session task per connection.
//! All sessions share a single `ConnectionRegistry` owned by the server.
//! Shutdown is a cancellation token: it stays cancelled, so a session
//! spawned after the signal still observes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::relay::{BroadcastRelay, SessionEnd, SessionHandler, SessionSettings};
use crate::Result;

/// Accept loop and session supervisor
pub struct RelayServer {
    listener: Option<TcpListener>,
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    relay: BroadcastRelay,
    connection_slots: Arc<Semaphore>,
    active_sessions: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Create a new server; nothing is bound until `bind`
    pub fn new(config: Arc<Config>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = BroadcastRelay::new(Arc::clone(&registry), config.server.write_timeout);
        let connection_slots = Arc::new(Semaphore::new(config.server.max_connections));

        Self {
            listener: None,
            config,
            registry,
            relay,
            connection_slots,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the listener and return the local address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!("Server is listening on {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Accept connections until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);

                            if self.shutdown.is_cancelled() {
                                debug!("Rejecting connection from {} due to shutdown", addr);
                                continue;
                            }

                            self.spawn_session(stream, addr);
                        }
                        Err(e) => {
                            // Transient; keep accepting
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Start a session for an accepted stream.
    ///
    /// Returns the identity assigned to it, or `None` when the connection
    /// limit is reached and the stream was dropped.
    pub fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) -> Option<ConnectionId> {
        let connection_slot = match Arc::clone(&self.connection_slots).try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {}", addr);
                return None;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = stream.into_split();
        let session = SessionHandler::new(
            id,
            Some(addr),
            reader,
            writer,
            self.relay.clone(),
            SessionSettings::from_config(&self.config.server),
        );

        let active_sessions = Arc::clone(&self.active_sessions);
        let shutdown = self.shutdown.clone();
        active_sessions.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _connection_slot = connection_slot;
            let started = Instant::now();
            info!("Started handling connection {} from {}", id, addr);

            let end = session
                .run_until(async move { shutdown.cancelled().await })
                .await;

            match &end {
                SessionEnd::HandshakeFailed(reason) => {
                    warn!("Connection {} from {} closed during handshake: {}", id, addr, reason)
                }
                SessionEnd::Rejected(reason) => {
                    error!("Connection {} from {} rejected: {}", id, addr, reason)
                }
                SessionEnd::ReadFailed(reason) => {
                    debug!("Connection {} from {} read failed: {}", id, addr, reason)
                }
                SessionEnd::TransportFailed => {
                    warn!("Connection {} from {} stopped accepting writes", id, addr)
                }
                SessionEnd::StreamClosed | SessionEnd::Shutdown => {}
            }

            info!("Connection {} from {} closed after {:?} ({:?})", id, addr, started.elapsed(), end);
            active_sessions.fetch_sub(1, Ordering::Relaxed);
        });

        Some(id)
    }

    /// Shared registry of live, named connections
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of running session tasks, named or not
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Stop accepting and signal every session to close
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of relay server");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for all sessions to finish, up to `shutdown_timeout`
    pub async fn wait_for_sessions_to_close(&self) -> Result<()> {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let start_time = Instant::now();

        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            self.active_sessions(),
            shutdown_timeout
        );

        while self.active_sessions() > 0 && start_time.elapsed() < shutdown_timeout {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_sessions();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All sessions closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                elapsed, remaining
            );
        }

        Ok(())
    }

    /// Gracefully shut the server down
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_sessions_to_close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn accepted_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        (stream, addr, client)
    }

    #[tokio::test]
    async fn test_session_spawned_after_shutdown_still_stops() {
        let server = RelayServer::new(Arc::new(Config::default()));
        server.initiate_shutdown();

        let (stream, addr, mut client) = accepted_pair().await;
        assert!(server.spawn_session(stream, addr).is_some());

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("session kept the transport open after shutdown");
        assert_eq!(read.unwrap(), 0);

        server.wait_for_sessions_to_close().await.unwrap();
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_identities_are_sequential() {
        let server = RelayServer::new(Arc::new(Config::default()));

        let (first, first_addr, _first_client) = accepted_pair().await;
        let (second, second_addr, _second_client) = accepted_pair().await;

        assert_eq!(server.spawn_session(first, first_addr), Some(ConnectionId::new(1)));
        assert_eq!(server.spawn_session(second, second_addr), Some(ConnectionId::new(2)));

        server.shutdown().await.unwrap();
    }
}
