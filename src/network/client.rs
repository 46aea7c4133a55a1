//! Document clients
//!
//! Both transports sit behind [`DocumentTransport`]: send a document, wait
//! for the server to echo it back. A missing acknowledgment is reported as
//! `Ok(None)`, never retried.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

use super::connection::{Connection, ConnectionError};
use super::NetworkConfig;
use crate::document::Document;
use crate::protocol::{recv_datagram, send_datagram, CodecError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("Server closed the connection")]
    ServerClosed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A way of handing a document to the server and getting it acknowledged
#[async_trait]
pub trait DocumentTransport: Send {
    /// Send `document` and wait for the acknowledgment.
    ///
    /// `Ok(None)` means no acknowledgment arrived in time.
    async fn exchange(&mut self, document: &Document) -> ClientResult<Option<Document>>;

    /// Address of the server
    fn server_addr(&self) -> SocketAddr;
}

/// Stream transport client.
///
/// Connects lazily and reconnects on the next exchange after a failure, so
/// an unreachable server is reported per request.
pub struct StreamClient {
    server_addr: SocketAddr,
    config: NetworkConfig,
    conn: Option<Connection>,
}

impl StreamClient {
    pub fn new(server_addr: SocketAddr, config: NetworkConfig) -> Self {
        Self {
            server_addr,
            config,
            conn: None,
        }
    }

    /// Establish the connection now rather than on first use
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.conn.as_ref().is_some_and(Connection::is_active) {
            return Ok(());
        }

        tracing::info!("Connecting to {}", self.server_addr);
        let conn = Connection::connect(self.server_addr, self.config.connect_timeout()).await?;
        self.conn = Some(conn);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_active)
    }

    /// Close the connection, if open
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    async fn try_exchange(&mut self, document: &Document) -> ClientResult<Option<Document>> {
        self.connect().await?;
        let ack_timeout = self.config.ack_timeout();
        let conn = self.conn.as_mut().ok_or(ClientError::ServerClosed)?;

        conn.send(document).await?;
        tracing::debug!("Waiting for acknowledgment of '{}'", document.name);

        let received = match ack_timeout {
            Some(timeout) => conn.recv_timeout(timeout).await,
            None => conn.recv().await,
        };

        match received {
            Ok(Some(ack)) => Ok(Some(ack)),
            Ok(None) => Err(ClientError::ServerClosed),
            Err(ConnectionError::Timeout) => {
                // A late acknowledgment would desynchronize the stream
                tracing::warn!("No acknowledgment within {:?}", ack_timeout);
                self.disconnect().await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DocumentTransport for StreamClient {
    async fn exchange(&mut self, document: &Document) -> ClientResult<Option<Document>> {
        let result = self.try_exchange(document).await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

/// Datagram transport client
pub struct DatagramClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    ack_timeout: Duration,
}

impl DatagramClient {
    /// Bind an ephemeral local socket for talking to `server_addr`
    pub async fn bind(server_addr: SocketAddr, ack_timeout: Duration) -> ClientResult<Self> {
        let local = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;

        tracing::debug!("Datagram client bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            server_addr,
            ack_timeout,
        })
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Wait for a datagram from the server, ignoring anyone else
    async fn recv_from_server(&self) -> ClientResult<Option<Document>> {
        loop {
            let (document, source) = recv_datagram(&self.socket).await?;
            if source == self.server_addr {
                return Ok(document);
            }
            tracing::debug!("Ignoring datagram from unexpected peer {}", source);
        }
    }
}

#[async_trait]
impl DocumentTransport for DatagramClient {
    async fn exchange(&mut self, document: &Document) -> ClientResult<Option<Document>> {
        send_datagram(&self.socket, self.server_addr, document).await?;
        tracing::debug!("Waiting up to {:?} for acknowledgment", self.ack_timeout);

        match tokio::time::timeout(self.ack_timeout, self.recv_from_server()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("No response in {:?}", self.ack_timeout);
                Ok(None)
            }
        }
    }

    fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MemoryStore;
    use crate::network::{DatagramServer, StreamServer};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn loopback() -> NetworkConfig {
        NetworkConfig::new(0).with_bind_address("127.0.0.1")
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = StreamClient::new("127.0.0.1:8080".parse().unwrap(), loopback());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let store = Arc::new(MemoryStore::new());
        let mut server = StreamServer::new(loopback(), store.clone());
        let addr = server.start().await.unwrap();

        let mut client = StreamClient::new(addr, loopback());
        let document = Document::new("g1", "digraph {A->B}");
        let ack = client.exchange(&document).await.unwrap();

        assert_eq!(ack, Some(document.clone()));
        assert!(client.is_connected());
        assert_eq!(store.get("g1").await, Some(document));

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_unreachable_then_recovers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = StreamClient::new(addr, loopback());
        let document = Document::new("g", "graph {}");
        assert!(client.exchange(&document).await.is_err());
        assert!(!client.is_connected());

        let config = NetworkConfig::new(addr.port()).with_bind_address("127.0.0.1");
        let mut server = StreamServer::new(config, Arc::new(MemoryStore::new()));
        server.start().await.unwrap();

        assert_eq!(client.exchange(&document).await.unwrap(), Some(document));

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ack_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts but never answers
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = loopback().with_ack_timeout(Duration::from_millis(100));
        let mut client = StreamClient::new(addr, config);
        let ack = client.exchange(&Document::new("g", "graph {}")).await.unwrap();

        assert!(ack.is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let store = Arc::new(MemoryStore::new());
        let mut server = DatagramServer::new(loopback(), store.clone());
        let addr = server.start().await.unwrap();

        let mut client = DatagramClient::bind(addr, Duration::from_secs(5)).await.unwrap();
        let document = Document::new("g1", "digraph {A->B}");
        let ack = client.exchange(&document).await.unwrap();

        assert_eq!(ack, Some(document.clone()));
        assert_eq!(store.get("g1").await, Some(document));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_datagram_no_server_times_out() {
        let vacant = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = vacant.local_addr().unwrap();
        drop(vacant);

        let timeout = Duration::from_secs(2);
        let mut client = DatagramClient::bind(addr, timeout).await.unwrap();

        let started = Instant::now();
        let ack = client.exchange(&Document::new("g1", "digraph {A->B}")).await.unwrap();

        assert!(ack.is_none());
        assert!(started.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn test_datagram_oversized_rejected_locally() {
        let mut client = DatagramClient::bind("127.0.0.1:9".parse().unwrap(), Duration::from_millis(10))
            .await
            .unwrap();
        let huge = Document::new("huge", "x".repeat(70_000));

        let result = client.exchange(&huge).await;
        assert!(matches!(result, Err(ClientError::Codec(CodecError::MessageTooLarge(..)))));
    }
}
