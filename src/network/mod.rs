//! Network module - Stream and datagram transports
//!
//! Provides:
//! - Stream server with one task per accepted connection
//! - Datagram server with a single sequential dispatch loop
//! - Clients for both transports behind a common trait

mod server;
mod datagram;
mod client;
mod connection;

pub use server::*;
pub use datagram::*;
pub use client::*;
pub use connection::*;

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Interface to bind servers to
    pub bind_address: String,
    /// Port to listen on
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a client waits for an acknowledgment; `None` waits forever
    pub ack_timeout_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_STREAM_PORT,
            connect_timeout_ms: 5000,
            ack_timeout_ms: None,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    /// `address:port` string servers bind to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Resolve a `host:port` string to a socket address
pub async fn resolve_addr(addr: &str) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host(addr).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve address: {}", addr),
        )
    })
}
