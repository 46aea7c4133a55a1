//! Connection handling for the stream transport
//!
//! Wraps one TCP stream and moves whole documents across it with the
//! length-prefixed codec, keeping per-connection state and statistics.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::document::Document;
use crate::protocol::{recv_frame, send_document, CodecError};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

impl ConnectionError {
    /// Whether the peer dropped the connection abruptly
    pub fn is_reset(&self) -> bool {
        matches!(self, ConnectionError::Codec(e) if e.is_reset())
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a served connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the next document
    AwaitingMessage,
    /// Storing and acknowledging a received document
    Processing,
    /// Terminal
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Documents sent
    pub documents_sent: u64,
    /// Documents received
    pub documents_received: u64,
    /// Bytes sent, including length prefixes
    pub bytes_sent: u64,
    /// Bytes received, including length prefixes
    pub bytes_received: u64,
}

/// A stream connection to a remote peer
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl Connection {
    /// Create a new connection from an established TCP stream
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            state: ConnectionState::AwaitingMessage,
            stats: ConnectionStats::default(),
        }
    }

    /// Connect to `addr`, giving up after `timeout`
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> ConnectionResult<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectionError::Codec(CodecError::Io(e))),
            Err(_) => return Err(ConnectionError::Timeout),
        };

        tracing::debug!(
            "Connected to {} from {}",
            addr,
            stream
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        );

        Ok(Self::new(stream, addr))
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a document
    pub async fn send(&mut self, document: &Document) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let written = send_document(&mut self.stream, document).await?;

        self.stats.documents_sent += 1;
        self.stats.bytes_sent += written as u64;
        Ok(())
    }

    /// Receive a document (`None` when the peer closed cleanly)
    pub async fn recv(&mut self) -> ConnectionResult<Option<Document>> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        match recv_frame(&mut self.stream).await? {
            Some((document, size)) => {
                self.stats.documents_received += 1;
                self.stats.bytes_received += size as u64;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    /// Wait until the next frame has started arriving, or the peer closed.
    ///
    /// Nothing is consumed, so cancelling this is safe.
    pub async fn readable(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let mut first = [0u8; 1];
        self.stream.peek(&mut first).await.map_err(CodecError::Io)?;
        Ok(())
    }

    /// Receive a document, giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Document>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.remote_addr, e);
        }
    }

    /// Check if the connection is still usable
    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::Closed
    }
}
