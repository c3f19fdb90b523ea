//! Tests for the per-connection session state machine

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::time::timeout;

use chat_relay::connection::{ConnectionId, ConnectionRegistry, ConnectionState, TransportHandle};
use chat_relay::protocol::{message_reader, message_writer, read_message, MessageReader};
use chat_relay::relay::{BroadcastRelay, SessionEnd, SessionHandler, SessionSettings};
use chat_relay::RelayError;

const BUFFER: usize = 64 * 1024;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    relay: BroadcastRelay,
}

impl Harness {
    fn new() -> Self {
        Self::with_write_timeout(Duration::from_secs(1))
    }

    fn with_write_timeout(write_timeout: Duration) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = BroadcastRelay::new(Arc::clone(&registry), write_timeout);
        Self { registry, relay }
    }

    /// A bystander registered directly in the registry
    fn bystander(&self, id: u64, name: &str) -> MessageReader<DuplexStream> {
        let (local, remote) = tokio::io::duplex(BUFFER);
        let id = ConnectionId::new(id);
        self.registry
            .register(id, name, TransportHandle::new(id, message_writer(local, 4096)))
            .unwrap();
        message_reader(remote, 4096)
    }

    /// A session plus the client end of its transport
    fn session(
        &self,
        id: u64,
        settings: SessionSettings,
    ) -> (
        SessionHandler<ReadHalf<DuplexStream>>,
        WriteHalf<DuplexStream>,
        MessageReader<ReadHalf<DuplexStream>>,
    ) {
        self.session_with_buffer(id, settings, BUFFER)
    }

    fn session_with_buffer(
        &self,
        id: u64,
        settings: SessionSettings,
        buffer: usize,
    ) -> (
        SessionHandler<ReadHalf<DuplexStream>>,
        WriteHalf<DuplexStream>,
        MessageReader<ReadHalf<DuplexStream>>,
    ) {
        let (server, client) = tokio::io::duplex(buffer);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let session = SessionHandler::new(
            ConnectionId::new(id),
            None,
            server_read,
            server_write,
            self.relay.clone(),
            settings,
        );
        (session, client_write, message_reader(client_read, 4096))
    }
}

async fn expect_line<R>(reader: &mut MessageReader<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    timeout(Duration::from_secs(2), read_message(reader))
        .await
        .expect("timed out waiting for a message")
        .expect("read failed")
}

async fn expect_silence<R>(reader: &mut MessageReader<R>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let result = timeout(Duration::from_millis(100), read_message(reader)).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (session, mut alice_out, mut alice_in) = harness.session(2, SessionSettings::default());

    let task = tokio::spawn(session.run());

    alice_out.write_all(b"Alice\n").await.unwrap();
    assert_eq!(expect_line(&mut bob).await, "Alice has joined the chat.");

    alice_out.write_all(b"hello\n\n   \nbye\0\n").await.unwrap();
    assert_eq!(expect_line(&mut bob).await, "Alice: hello");
    assert_eq!(expect_line(&mut bob).await, "Alice: bye");

    alice_out.shutdown().await.unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::StreamClosed);
    assert_eq!(expect_line(&mut bob).await, "Alice has left the chat.");

    // Alice never hears her own traffic, and her transport is released
    assert!(matches!(
        read_message(&mut alice_in).await,
        Err(RelayError::StreamClosed)
    ));
    assert_eq!(harness.registry.display_names(), vec!["Bob"]);
}

#[tokio::test]
async fn test_empty_name_closes_without_registering() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");

    let mock = tokio_test::io::Builder::new().read(b" \r\n").build();
    let (reader, writer) = tokio::io::split(mock);
    let session = SessionHandler::new(
        ConnectionId::new(2),
        None,
        reader,
        writer,
        harness.relay.clone(),
        SessionSettings::default(),
    );

    let end = session.run().await;

    assert!(matches!(end, SessionEnd::HandshakeFailed(_)));
    assert!(!harness.registry.contains(ConnectionId::new(2)));
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn test_stream_closed_before_name() {
    let harness = Harness::new();
    let (session, mut client_out, _client_in) = harness.session(1, SessionSettings::default());

    client_out.shutdown().await.unwrap();

    assert!(matches!(session.run().await, SessionEnd::HandshakeFailed(_)));
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_handshake_timeout() {
    let harness = Harness::new();
    let settings = SessionSettings {
        handshake_timeout: Duration::from_millis(100),
        ..SessionSettings::default()
    };
    let (session, _client_out, mut client_in) = harness.session(1, settings);

    let end = timeout(Duration::from_secs(2), session.run()).await.unwrap();

    assert!(matches!(end, SessionEnd::HandshakeFailed(_)));
    assert!(harness.registry.is_empty());
    assert!(matches!(
        read_message(&mut client_in).await,
        Err(RelayError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_name_too_long_is_rejected() {
    let harness = Harness::new();
    let settings = SessionSettings {
        max_name_length: 4,
        ..SessionSettings::default()
    };
    let (mut session, mut client_out, _client_in) = harness.session(1, settings);

    client_out.write_all(b"Bartholomew\n").await.unwrap();

    let err = session.perform_handshake().await.unwrap_err();
    assert!(matches!(err, RelayError::HandshakeFailure(_)));
    assert_eq!(session.connection().state(), ConnectionState::Connecting);
}

#[tokio::test]
async fn test_close_runs_once() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (mut session, mut alice_out, _alice_in) = harness.session(2, SessionSettings::default());

    alice_out.write_all(b"Alice\n").await.unwrap();
    assert_eq!(session.perform_handshake().await.unwrap(), "Alice");
    assert_eq!(session.connection().state(), ConnectionState::Named);

    let report = session.activate().await.unwrap();
    assert_eq!(report.delivered, vec![ConnectionId::new(1)]);
    assert_eq!(session.connection().state(), ConnectionState::Active);
    assert_eq!(expect_line(&mut bob).await, "Alice has joined the chat.");

    assert!(session.close().await);
    assert!(!session.close().await);
    assert!(!session.close().await);

    assert_eq!(session.connection().state(), ConnectionState::Closed);
    assert_eq!(expect_line(&mut bob).await, "Alice has left the chat.");
    expect_silence(&mut bob).await;
    assert!(!harness.registry.contains(ConnectionId::new(2)));
}

#[tokio::test]
async fn test_unnamed_close_sends_no_leave_notice() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (mut session, _client_out, _client_in) = harness.session(2, SessionSettings::default());

    assert!(session.close().await);

    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn test_shutdown_interrupts_active_session() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (session, mut alice_out, mut alice_in) = harness.session(2, SessionSettings::default());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(session.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    alice_out.write_all(b"Alice\n").await.unwrap();
    assert_eq!(expect_line(&mut bob).await, "Alice has joined the chat.");

    shutdown_tx.send(()).unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);

    assert_eq!(expect_line(&mut bob).await, "Alice has left the chat.");
    assert!(matches!(
        read_message(&mut alice_in).await,
        Err(RelayError::StreamClosed)
    ));
    assert_eq!(harness.registry.len(), 1);
}

#[tokio::test]
async fn test_duplicate_identity_is_rejected() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (session, mut imposter_out, _imposter_in) = harness.session(1, SessionSettings::default());

    imposter_out.write_all(b"Imposter\n").await.unwrap();
    let end = session.run().await;

    assert!(matches!(end, SessionEnd::Rejected(_)));
    // The existing entry is untouched and nobody was told anything
    assert_eq!(harness.registry.display_names(), vec!["Bob"]);
    expect_silence(&mut bob).await;
}

#[tokio::test]
async fn test_max_length_line_is_relayed_within_limit() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (session, mut alice_out, _alice_in) = harness.session(2, SessionSettings::default());
    let task = tokio::spawn(session.run());

    alice_out.write_all(b"Alice\n").await.unwrap();
    assert_eq!(expect_line(&mut bob).await, "Alice has joined the chat.");

    let mut long = "x".repeat(4096);
    long.push('\n');
    alice_out.write_all(long.as_bytes()).await.unwrap();
    alice_out.write_all(b"after\n").await.unwrap();

    // Bob reads with the same limit the server accepts with
    let relayed = expect_line(&mut bob).await;
    assert_eq!(relayed.len(), 4096);
    assert!(relayed.starts_with("Alice: xxx"));
    assert_eq!(expect_line(&mut bob).await, "Alice: after");

    alice_out.shutdown().await.unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::StreamClosed);
}

#[tokio::test]
async fn test_invalid_utf8_ends_session_with_leave_notice() {
    let harness = Harness::new();
    let mut bob = harness.bystander(1, "Bob");
    let (session, mut alice_out, _alice_in) = harness.session(2, SessionSettings::default());
    let task = tokio::spawn(session.run());

    alice_out.write_all(b"Alice\n").await.unwrap();
    assert_eq!(expect_line(&mut bob).await, "Alice has joined the chat.");

    alice_out.write_all(b"\xff\xfe\n").await.unwrap();

    let end = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(end, SessionEnd::ReadFailed(_)));
    assert_eq!(expect_line(&mut bob).await, "Alice has left the chat.");
    assert!(!harness.registry.contains(ConnectionId::new(2)));
}

#[tokio::test]
async fn test_stalled_recipient_is_closed_and_announced() {
    let harness = Harness::with_write_timeout(Duration::from_millis(100));
    let mut carol = harness.bystander(1, "Carol");

    // Bob's client never reads, and its pipe holds only a few bytes
    let (session, mut bob_out, mut bob_in) =
        harness.session_with_buffer(2, SessionSettings::default(), 32);
    let task = tokio::spawn(session.run());

    bob_out.write_all(b"Bob\n").await.unwrap();
    assert_eq!(expect_line(&mut carol).await, "Bob has joined the chat.");

    let report = harness
        .relay
        .broadcast(&format!("Carol: {}", "y".repeat(256)), ConnectionId::new(1))
        .await;
    assert_eq!(report.failed, vec![ConnectionId::new(2)]);

    let end = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::TransportFailed);
    assert_eq!(expect_line(&mut carol).await, "Bob has left the chat.");
    expect_silence(&mut carol).await;
    assert_eq!(harness.registry.display_names(), vec!["Carol"]);

    // When Bob reads again he finds the connection ended, not a silent one
    let drained = timeout(Duration::from_secs(2), async {
        while read_message(&mut bob_in).await.is_ok() {}
    })
    .await;
    assert!(drained.is_ok());
}
