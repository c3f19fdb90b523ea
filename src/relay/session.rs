//! Relay Session
//!
//! Per-connection control loop. A session walks
//! `Connecting -> Named -> Active -> Closed`:
//!
//! - `Connecting`: the first line is the display name. A read failure, an
//!   empty name or the handshake timeout closes the connection without ever
//!   registering it.
//! - `Named`: the connection is registered and `"<name> has joined the
//!   chat."` goes out to everyone else.
//! - `Active`: each line read is relayed as `"<name>: <line>"` until the
//!   stream ends or fails. The relayed line is cut to the line limit so
//!   every receiver can decode it.
//! - `Closed`: unregister, announce `"<name> has left the chat."` if the
//!   connection was registered, then release the transport. Runs once.
//!
//! A failed write to this connection (from any broadcast) also ends the
//! session, so a peer that stopped reading is announced as gone instead of
//! staying registered and deaf.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::broadcast::{BroadcastRelay, DeliveryReport};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState, Registration, TransportHandle};
use crate::error::RelayError;
use crate::protocol::{
    chat_message, fit_payload, join_notice, leave_notice, message_reader, message_writer,
    normalize_payload, parse_display_name, read_message, MessageReader, DEFAULT_MAX_LINE_LENGTH,
    DEFAULT_MAX_NAME_LENGTH,
};

/// Per-session limits, taken from the server configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub max_line_length: usize,
    pub max_name_length: usize,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_line_length: config.max_line_length,
            max_name_length: config.max_name_length,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// No usable display name; never registered
    HandshakeFailed(String),
    /// Peer closed the stream
    StreamClosed,
    /// Reading from the peer failed
    ReadFailed(String),
    /// A write to the peer failed or timed out
    TransportFailed,
    /// Server shutdown interrupted the session
    Shutdown,
    /// Registration was refused (identity already present)
    Rejected(String),
}

/// Drives one connection through its lifecycle
pub struct SessionHandler<R> {
    connection: Connection,
    reader: MessageReader<R>,
    handle: TransportHandle,
    relay: BroadcastRelay,
    settings: SessionSettings,
    registration: Option<Registration>,
}

impl<R> SessionHandler<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Build a session in the `Connecting` state from the two halves of
    /// an accepted transport
    pub fn new<W>(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        reader: R,
        writer: W,
        relay: BroadcastRelay,
        settings: SessionSettings,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let handle = TransportHandle::new(id, message_writer(writer, settings.max_line_length));
        Self {
            connection: Connection::new(id, peer_addr),
            reader: message_reader(reader, settings.max_line_length),
            handle,
            relay,
            settings,
            registration: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run until the connection closes
    pub async fn run(self) -> SessionEnd {
        self.run_until(std::future::pending()).await
    }

    /// Run until the connection closes, its transport fails or `shutdown`
    /// resolves, then clean up
    #[instrument(
        skip_all,
        fields(connection_id = %self.connection.id(), peer = ?self.connection.peer_addr())
    )]
    pub async fn run_until<F>(mut self, shutdown: F) -> SessionEnd
    where
        F: Future<Output = ()>,
    {
        let handle = self.handle.clone();
        let end = tokio::select! {
            end = self.drive() => end,
            _ = handle.failed() => {
                debug!("Session transport failed");
                SessionEnd::TransportFailed
            }
            _ = shutdown => {
                debug!("Session interrupted by shutdown");
                SessionEnd::Shutdown
            }
        };

        self.close().await;
        end
    }

    async fn drive(&mut self) -> SessionEnd {
        if let Err(e) = self.perform_handshake().await {
            debug!("Handshake failed: {}", e);
            return SessionEnd::HandshakeFailed(e.to_string());
        }

        if let Err(e) = self.activate().await {
            error!("Registration refused: {}", e);
            return SessionEnd::Rejected(e.to_string());
        }

        self.relay_messages().await
    }

    /// `Connecting -> Named`: read and validate the display name
    pub async fn perform_handshake(&mut self) -> Result<String, RelayError> {
        let line = match timeout(self.settings.handshake_timeout, read_message(&mut self.reader)).await
        {
            Ok(Ok(line)) => line,
            Ok(Err(RelayError::StreamClosed)) => {
                return Err(RelayError::HandshakeFailure(
                    "stream closed before a name was received".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(RelayError::HandshakeFailure(e.to_string())),
            Err(_) => {
                return Err(RelayError::HandshakeFailure(format!(
                    "no name received within {:?}",
                    self.settings.handshake_timeout
                )))
            }
        };

        let name = parse_display_name(&line, self.settings.max_name_length)?;
        self.connection.set_display_name(name.clone())?;
        self.connection.transition(ConnectionState::Named);
        Ok(name)
    }

    /// `Named -> Active`: register and announce the join to everyone else
    pub async fn activate(&mut self) -> Result<DeliveryReport, RelayError> {
        let id = self.connection.id();
        let name = self.connection.display_name().to_string();

        let registration = self
            .relay
            .registry()
            .register_guarded(id, &name, self.handle.clone())?;
        self.registration = Some(registration);

        info!(
            name = %name,
            peer = ?self.connection.peer_addr(),
            "Client '{}' connected.", name
        );

        let report = self.relay.broadcast(&join_notice(&name), id).await;
        self.connection.transition(ConnectionState::Active);
        Ok(report)
    }

    /// `Active`: relay each received line until the stream ends or fails
    pub async fn relay_messages(&mut self) -> SessionEnd {
        let id = self.connection.id();
        loop {
            match read_message(&mut self.reader).await {
                Ok(line) => {
                    let payload = normalize_payload(&line);
                    if payload.trim().is_empty() {
                        continue;
                    }
                    let name = self.connection.display_name();
                    let fitted = fit_payload(name, payload, self.settings.max_line_length);
                    if fitted.len() < payload.len() {
                        warn!(
                            name = %name,
                            length = payload.len(),
                            "Message cut to fit the line limit"
                        );
                    }
                    let message = chat_message(name, fitted);
                    debug!("Received: {}", message);
                    self.relay.broadcast(&message, id).await;
                }
                Err(RelayError::StreamClosed) => return SessionEnd::StreamClosed,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    return SessionEnd::ReadFailed(e.to_string());
                }
            }
        }
    }

    /// `* -> Closed`: unregister, announce the leave and release the
    /// transport. Only the first call does anything; it returns `true`.
    pub async fn close(&mut self) -> bool {
        if self.connection.transition(ConnectionState::Closed).is_none() {
            return false;
        }

        let was_registered = self
            .registration
            .take()
            .map(|mut registration| registration.release())
            .unwrap_or(false);

        if was_registered {
            let name = self.connection.display_name().to_string();
            info!(
                name = %name,
                duration_ms = self.connection.duration().as_millis() as u64,
                "Client '{}' disconnected.", name
            );
            self.relay
                .broadcast(&leave_notice(&name), self.connection.id())
                .await;
        }

        self.handle.shutdown(self.relay.write_timeout()).await;
        true
    }
}
