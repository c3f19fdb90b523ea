//! Line Framing
//!
//! One message unit is one `\n`-terminated UTF-8 line, in both directions.
//! A raw stream read carries no message boundary, so every transport is
//! wrapped in a `LinesCodec` with a bounded line length before it reaches
//! the session or the relay.

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::error::RelayError;

/// Framed read half of a connection
pub type MessageReader<R> = FramedRead<R, LinesCodec>;

/// Framed read half for receivers that skip lines they cannot hold
pub type LenientMessageReader<R> = FramedRead<R, LenientLinesCodec>;

/// Framed write half of a connection, type-erased over the transport
pub type MessageWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

/// Wrap a read half in line framing
pub fn message_reader<R: AsyncRead>(reader: R, max_line_length: usize) -> MessageReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length))
}

/// Wrap a write half in line framing
pub fn message_writer<W>(writer: W, max_line_length: usize) -> MessageWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
    FramedWrite::new(writer, LinesCodec::new_with_max_length(max_line_length))
}

/// Line decoder that drops over-long lines instead of failing.
///
/// `FramedRead` stops for good after a decode error, which would end a
/// receiving client over a single line it cannot hold. The inner codec
/// already discards up to the next newline after reporting the overflow,
/// so skipping is just a matter of decoding again.
#[derive(Debug, Clone)]
pub struct LenientLinesCodec {
    inner: LinesCodec,
}

impl LenientLinesCodec {
    pub fn new_with_max_length(max_line_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_length),
        }
    }
}

impl Decoder for LenientLinesCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        limit = self.inner.max_length(),
                        "Skipping line over the maximum length"
                    );
                }
                other => return other,
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode_eof(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        limit = self.inner.max_length(),
                        "Skipping line over the maximum length"
                    );
                }
                other => return other,
            }
        }
    }
}

/// Read the next message unit
///
/// End-of-stream maps to `StreamClosed`; codec and I/O errors map to
/// `ReadFailure`.
pub async fn read_message<R, D>(reader: &mut FramedRead<R, D>) -> Result<String, RelayError>
where
    R: AsyncRead + Unpin,
    D: Decoder<Item = String, Error = LinesCodecError>,
{
    match reader.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(e.into()),
        None => Err(RelayError::StreamClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_merged_writes_split_into_lines() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = message_reader(server, 64);

        client.write_all(b"first\nsecond\r\nthi").await.unwrap();
        client.write_all(b"rd\n").await.unwrap();

        assert_eq!(read_message(&mut reader).await.unwrap(), "first");
        assert_eq!(read_message(&mut reader).await.unwrap(), "second");
        assert_eq!(read_message(&mut reader).await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_end_of_stream_is_stream_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut reader = message_reader(server, 64);

        assert!(matches!(
            read_message(&mut reader).await,
            Err(RelayError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_line_is_read_failure() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = message_reader(server, 8);

        client.write_all(b"this line is far too long\n").await.unwrap();

        assert!(matches!(
            read_message(&mut reader).await,
            Err(RelayError::ReadFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_lenient_reader_skips_oversized_line() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = FramedRead::new(server, LenientLinesCodec::new_with_max_length(8));

        client.write_all(b"short\n").await.unwrap();
        client.write_all(b"this line is far too long\n").await.unwrap();
        client.write_all(b"after\n").await.unwrap();
        drop(client);

        assert_eq!(read_message(&mut reader).await.unwrap(), "short");
        assert_eq!(read_message(&mut reader).await.unwrap(), "after");
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RelayError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_read_failure() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = message_reader(server, 64);

        client.write_all(b"ok\n\xff\xfe\n").await.unwrap();

        assert_eq!(read_message(&mut reader).await.unwrap(), "ok");
        assert!(matches!(
            read_message(&mut reader).await,
            Err(RelayError::ReadFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_appends_terminator() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = message_writer(client, 64);
        let mut reader = message_reader(server, 64);

        writer.send("hello").await.unwrap();
        assert_eq!(read_message(&mut reader).await.unwrap(), "hello");
    }
}
