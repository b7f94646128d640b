//! # Output Channels
//!
//! The duplex transport between tickbar and the status-bar host. Lines go out
//! on the write side; host events come back on the read side.
//!
//! `reconnect()` tears the transport down and builds a fresh one. Nothing
//! queued before the break is replayed: the next tick renders the current
//! registry anyway.

use std::fmt;
use std::io;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

const MEMORY_CHANNEL_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub enum TransportError {
    Write(io::Error),
    Read(io::Error),
    /// The host stopped draining the write side.
    Stalled(std::time::Duration),
    /// The channel was released or could not be re-established.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Write(e) => write!(f, "write failed: {e}"),
            TransportError::Read(e) => write!(f, "read failed: {e}"),
            TransportError::Stalled(after) => write!(f, "write stalled for {after:?}"),
            TransportError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type ReadSide = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Channel: Send {
    /// Hands out the read half of the current connection. `None` once taken,
    /// or when the transport has nothing to read.
    fn read_side(&mut self) -> Option<ReadSide>;

    fn write_side(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);

    async fn reconnect(&mut self) -> Result<(), TransportError>;

    async fn release(&mut self);
}

// ============================================================================
// Stdio
// ============================================================================

/// stdout for lines, stdin for events: how status bars spawn their generator.
pub struct StdioChannel {
    stdout: tokio::io::Stdout,
    stdin: Option<tokio::io::Stdin>,
}

impl StdioChannel {
    pub fn new() -> Self {
        Self {
            stdout: tokio::io::stdout(),
            stdin: Some(tokio::io::stdin()),
        }
    }
}

impl Default for StdioChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for StdioChannel {
    fn read_side(&mut self) -> Option<ReadSide> {
        self.stdin.take().map(|stdin| Box::new(stdin) as ReadSide)
    }

    fn write_side(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stdout
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        // The process streams cannot be reopened; a fresh handle is the best we get.
        debug!("Reacquiring stdout");
        self.stdout = tokio::io::stdout();
        Ok(())
    }

    async fn release(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stdout.flush().await;
        self.stdin = None;
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// A channel backed by in-process pipes. Every (re)connect hands the far end
/// to the paired [`MemoryHost`], which plays the status-bar host.
pub struct MemoryChannel {
    write: DuplexStream,
    read: Option<DuplexStream>,
    connections: mpsc::UnboundedSender<MemoryConnection>,
    released: bool,
}

/// The host's end of one connection.
pub struct MemoryConnection {
    /// What tickbar wrote.
    pub lines: DuplexStream,
    /// Where the host writes events for tickbar.
    pub events: DuplexStream,
}

pub struct MemoryHost {
    connections: mpsc::UnboundedReceiver<MemoryConnection>,
}

impl MemoryHost {
    /// Waits for the next connection made by the channel.
    pub async fn accept(&mut self) -> Option<MemoryConnection> {
        self.connections.recv().await
    }
}

impl MemoryChannel {
    pub fn new() -> (Self, MemoryHost) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (write, read) = Self::connect(&tx);
        let channel = Self {
            write,
            read: Some(read),
            connections: tx,
            released: false,
        };
        (channel, MemoryHost { connections: rx })
    }

    fn connect(
        connections: &mpsc::UnboundedSender<MemoryConnection>,
    ) -> (DuplexStream, DuplexStream) {
        let (write, lines) = tokio::io::duplex(MEMORY_CHANNEL_BUFFER);
        let (events, read) = tokio::io::duplex(MEMORY_CHANNEL_BUFFER);
        // A host that went away just means nobody is listening.
        let _ = connections.send(MemoryConnection { lines, events });
        (write, read)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn read_side(&mut self) -> Option<ReadSide> {
        self.read.take().map(|read| Box::new(read) as ReadSide)
    }

    fn write_side(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.write
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        if self.released {
            return Err(TransportError::Closed);
        }
        let (write, read) = Self::connect(&self.connections);
        self.write = write;
        self.read = Some(read);
        Ok(())
    }

    async fn release(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.write.shutdown().await;
        self.read = None;
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_channel_round_trip() {
        let (mut channel, mut host) = MemoryChannel::new();
        let mut conn = host.accept().await.unwrap();

        channel.write_side().write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        conn.lines.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        conn.events.write_all(b"click\n").await.unwrap();
        let mut read = channel.read_side().unwrap();
        let mut buf = [0u8; 6];
        read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"click\n");
        assert!(channel.read_side().is_none());
    }

    #[tokio::test]
    async fn test_write_fails_after_host_drops_and_reconnect_recovers() {
        let (mut channel, mut host) = MemoryChannel::new();
        drop(host.accept().await.unwrap());

        let err = channel.write_side().write_all(b"lost\n").await;
        assert!(err.is_err());

        channel.reconnect().await.unwrap();
        let mut conn = host.accept().await.unwrap();
        channel.write_side().write_all(b"fresh\n").await.unwrap();
        let mut buf = [0u8; 6];
        conn.lines.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fresh\n");
        assert!(channel.read_side().is_some());
    }

    #[tokio::test]
    async fn test_released_channel_refuses_reconnect() {
        let (mut channel, _host) = MemoryChannel::new();
        channel.release().await;
        assert!(matches!(channel.reconnect().await, Err(TransportError::Closed)));
        assert!(channel.read_side().is_none());
    }
}
