//! Console Client
//!
//! Connects to a relay, sends the display name as the first line, then
//! prints every received line while forwarding stdin lines to the server.
//! A received line over the length limit is skipped; the connection stays up.

use std::net::SocketAddr;

use anyhow::Context;
use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info};

use crate::error::RelayError;
use crate::protocol::{
    read_message, LenientLinesCodec, LenientMessageReader, DEFAULT_MAX_LINE_LENGTH, NAME_PROMPT,
};
use crate::Result;

/// Receiving half of a client connection
pub struct ClientReader {
    reader: LenientMessageReader<OwnedReadHalf>,
}

impl ClientReader {
    /// Next line from the server, `None` once the server closed the stream
    pub async fn recv(&mut self) -> Result<Option<String>> {
        match read_message(&mut self.reader).await {
            Ok(line) => Ok(Some(line)),
            Err(RelayError::StreamClosed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sending half of a client connection
pub struct ClientWriter {
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl ClientWriter {
    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.writer
            .send(text)
            .await
            .context("Failed to send message")?;
        Ok(())
    }

    /// Close the write side; the server sees end-of-stream
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<&str>::close(&mut self.writer)
            .await
            .context("Failed to close connection")?;
        Ok(())
    }
}

/// A connected, named chat client
pub struct ChatClient {
    reader: ClientReader,
    writer: ClientWriter,
}

impl ChatClient {
    /// Connect to `addr` and perform the name handshake
    pub async fn connect(addr: SocketAddr, name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Connection to server {} failed", addr))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: ClientReader {
                reader: FramedRead::new(
                    read_half,
                    LenientLinesCodec::new_with_max_length(DEFAULT_MAX_LINE_LENGTH),
                ),
            },
            writer: ClientWriter {
                writer: FramedWrite::new(write_half, LinesCodec::new()),
            },
        };

        client.writer.send(name).await?;
        Ok(client)
    }

    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.writer.send(text).await
    }

    pub async fn recv(&mut self) -> Result<Option<String>> {
        self.reader.recv().await
    }

    pub fn split(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }
}

/// Interactive loop over stdin/stdout
pub async fn run_console(addr: SocketAddr, name: Option<String>) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let name = match name {
        Some(name) => name,
        None => {
            stdout.write_all(NAME_PROMPT.as_bytes()).await?;
            stdout.flush().await?;
            stdin
                .next_line()
                .await?
                .context("stdin closed before a name was entered")?
        }
    };

    let client = ChatClient::connect(addr, &name).await?;
    info!("Joined {} as '{}'", addr, name);
    let (mut reader, mut writer) = client.split();

    let mut printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = reader.recv().await? {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                match line? {
                    Some(line) if line.is_empty() => continue,
                    Some(line) => writer.send(&line).await?,
                    None => {
                        debug!("stdin closed, leaving chat");
                        writer.close().await?;
                        break;
                    }
                }
            }
            result = &mut printer => {
                info!("Server closed the connection");
                return result.context("Receiver task failed")?;
            }
        }
    }

    printer.abort();
    Ok(())
}
