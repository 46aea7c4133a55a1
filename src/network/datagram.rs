//! Datagram server
//!
//! A single task owns the socket and handles datagrams strictly in order:
//! decode the raw record, store the document, acknowledge to the sender.
//! Nothing that goes wrong with one datagram stops the loop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use super::server::{emit, ServerError, ServerEvent, ServerResult};
use super::NetworkConfig;
use crate::document::{Document, DocumentStore, StoreError};
use crate::protocol::{
    decode_dispatch_record, encode_acknowledgment, preview, CodecError, MAX_BUFFER_SIZE,
};

/// Result of handling one datagram
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Not decodable as a document; nothing stored, nothing sent
    Skipped(CodecError),
    /// Decoded but not stored; no acknowledgment
    StorageFailed(Document, StoreError),
    /// Stored at `path`; `ack` is the acknowledgment to send back
    Acknowledge {
        document: Document,
        path: PathBuf,
        ack: Vec<u8>,
    },
}

/// Decode and store one datagram body
pub async fn dispatch_datagram(store: &dyn DocumentStore, bytes: &[u8]) -> DispatchOutcome {
    let document = match decode_dispatch_record(bytes) {
        Ok(document) => document,
        Err(e) => {
            tracing::debug!("Rejected datagram: {}", preview(bytes));
            return DispatchOutcome::Skipped(e);
        }
    };

    let path = match store.save(&document).await {
        Ok(path) => path,
        Err(e) => return DispatchOutcome::StorageFailed(document, e),
    };

    match encode_acknowledgment(&document) {
        Ok(ack) => DispatchOutcome::Acknowledge { document, path, ack },
        Err(e) => DispatchOutcome::Skipped(e),
    }
}

/// Datagram transport server
pub struct DatagramServer {
    /// Server configuration
    config: NetworkConfig,
    /// Where received documents go
    store: Arc<dyn DocumentStore>,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Dispatch loop task
    loop_task: Option<JoinHandle<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl DatagramServer {
    /// Create a new server
    pub fn new(config: NetworkConfig, store: Arc<dyn DocumentStore>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            store,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            loop_task: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the socket and start the dispatch loop. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.bind_addr();
        let socket = UdpSocket::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = socket.local_addr()?;
        tracing::info!("Datagram server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let store = self.store.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        self.loop_task = Some(tokio::spawn(async move {
            dispatch_loop(socket, store, event_tx.clone(), shutdown_rx).await;

            let mut running = running.write().await;
            *running = false;

            emit(&event_tx, ServerEvent::Stopped);
        }));

        Ok(local_addr)
    }

    /// Stop the loop once the datagram in hand, if any, is handled
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(task) = self.loop_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Dispatch loop panicked: {}", e);
            }
        }

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn dispatch_loop(
    socket: UdpSocket,
    store: Arc<dyn DocumentStore>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];

    loop {
        let (n, source) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Receive error: {}", e);
                    continue;
                }
            },
            _ = shutdown_rx.changed() => {
                tracing::info!("Server shutdown requested");
                break;
            }
        };

        tracing::debug!("Received {} bytes from {}", n, source);

        match dispatch_datagram(store.as_ref(), &buf[..n]).await {
            DispatchOutcome::Skipped(e) => {
                tracing::warn!("Skipping datagram from {}: {}", source, e);
            }
            DispatchOutcome::StorageFailed(document, e) => {
                tracing::error!("Error saving '{}': {}", document.name, e);
                emit(&event_tx, ServerEvent::StorageFailed {
                    addr: source,
                    name: document.name,
                    error: e.to_string(),
                });
            }
            DispatchOutcome::Acknowledge { document, path, ack } => {
                tracing::info!("Stored '{}' from {} at {}", document.name, source, path.display());
                emit(&event_tx, ServerEvent::DocumentStored {
                    addr: source,
                    name: document.name.clone(),
                    path,
                });

                match socket.send_to(&ack, source).await {
                    Ok(sent) => tracing::debug!(
                        "Sent acknowledgment for '{}' to {} ({} bytes)",
                        document.name,
                        source,
                        sent
                    ),
                    Err(e) => tracing::warn!("Error acknowledging {}: {}", source, e),
                }
            }
        }
    }
}
