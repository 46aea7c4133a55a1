//! Stream server
//!
//! Accepts connections on one listener and serves each on its own task.
//! Every connection loops: receive a document, store it, echo it back as
//! the acknowledgment. Handlers share nothing but the document store.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::{Connection, ConnectionState};
use super::NetworkConfig;
use crate::document::DocumentStore;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by both servers
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started {
        bind_addr: SocketAddr,
    },
    /// A stream peer has connected
    PeerConnected {
        addr: SocketAddr,
    },
    /// A stream peer's connection ended
    PeerDisconnected {
        addr: SocketAddr,
        reason: CloseReason,
    },
    /// A document was stored
    DocumentStored {
        addr: SocketAddr,
        name: String,
        path: PathBuf,
    },
    /// A document could not be stored; no acknowledgment was sent
    StorageFailed {
        addr: SocketAddr,
        name: String,
        error: String,
    },
    /// Server stopped
    Stopped,
}

/// Why a served connection reached its terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer shut down cleanly between messages
    PeerClosed,
    /// Peer dropped the connection abruptly
    Reset,
    /// Inbound bytes could not be decoded
    Protocol(String),
    /// The acknowledgment could not be written
    SendFailed(String),
    /// The server is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer disconnected"),
            CloseReason::Reset => write!(f, "connection reset"),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::SendFailed(e) => write!(f, "send failed: {}", e),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Publish an event without ever blocking a handler on a slow consumer
pub(crate) fn emit(events: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(e) = events.try_send(event) {
        tracing::trace!("Dropped server event: {}", e);
    }
}

/// Stream transport server
pub struct StreamServer {
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
    /// Accept loop task
    accept_task: Option<JoinHandle<()>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl StreamServer {
    /// Create a new server
    pub fn new(config: NetworkConfig, store: Arc<dyn DocumentStore>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            store,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Stream server listening on {}", local_addr);

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

        self.accept_task = Some(tokio::spawn(async move {
            accept_loop(listener, store, event_tx.clone(), shutdown_rx).await;

            let mut running = running.write().await;
            *running = false;

            emit(&event_tx, ServerEvent::Stopped);
        }));

        Ok(local_addr)
    }

    /// Stop accepting and wait for connection handlers to wind down
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

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop panicked: {}", e);
            }
        }

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<dyn DocumentStore>,
    event_tx: mpsc::Sender<ServerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("New connection from {}", addr);

                        handlers.spawn(serve_stream(
                            stream,
                            addr,
                            store.clone(),
                            event_tx.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = finished {
                    tracing::error!("Connection handler panicked: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Server shutdown requested");
                break;
            }
        }
    }

    drop(listener);

    while let Some(finished) = handlers.join_next().await {
        if let Err(e) = finished {
            tracing::error!("Connection handler panicked: {}", e);
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<dyn DocumentStore>,
    event_tx: mpsc::Sender<ServerEvent>,
    shutdown_rx: watch::Receiver<bool>,
) {
    emit(&event_tx, ServerEvent::PeerConnected { addr });

    let mut conn = Connection::new(stream, addr);
    let reason = handle_connection(&mut conn, store.as_ref(), &event_tx, shutdown_rx).await;

    let stats = conn.stats();
    tracing::info!(
        "Closed connection to {} ({}; {} received / {} bytes, {} acknowledged / {} bytes)",
        addr,
        reason,
        stats.documents_received,
        stats.bytes_received,
        stats.documents_sent,
        stats.bytes_sent
    );

    emit(&event_tx, ServerEvent::PeerDisconnected { addr, reason });
}

/// Serve one connection until it reaches its terminal state.
///
/// A storage failure withholds the acknowledgment but keeps the connection
/// open. Decode errors, resets, and failed acknowledgments close it.
pub async fn handle_connection(
    conn: &mut Connection,
    store: &dyn DocumentStore,
    event_tx: &mpsc::Sender<ServerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> CloseReason {
    let addr = conn.remote_addr();

    let reason = loop {
        conn.set_state(ConnectionState::AwaitingMessage);
        let stopping = *shutdown_rx.borrow();
        if stopping {
            break CloseReason::Shutdown;
        }

        tracing::debug!("Waiting for data from {}", addr);

        // Shutdown is only honored before a frame starts; once a byte has
        // arrived the frame is read to completion.
        let ready = tokio::select! {
            result = conn.readable() => result,
            _ = shutdown_rx.changed() => break CloseReason::Shutdown,
        };
        let received = match ready {
            Ok(()) => conn.recv().await,
            Err(e) => Err(e),
        };

        let document = match received {
            Ok(Some(document)) => document,
            Ok(None) => break CloseReason::PeerClosed,
            Err(e) if e.is_reset() => break CloseReason::Reset,
            Err(e) => {
                tracing::warn!("Bad message from {}: {}", addr, e);
                break CloseReason::Protocol(e.to_string());
            }
        };

        conn.set_state(ConnectionState::Processing);
        tracing::info!("Received '{}' from {}", document.name, addr);

        match store.save(&document).await {
            Ok(path) => {
                tracing::info!("Stored '{}' at {}", document.name, path.display());
                emit(event_tx, ServerEvent::DocumentStored {
                    addr,
                    name: document.name.clone(),
                    path,
                });
            }
            Err(e) => {
                tracing::error!("Error saving '{}': {}", document.name, e);
                emit(event_tx, ServerEvent::StorageFailed {
                    addr,
                    name: document.name.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        }

        if let Err(e) = conn.send(&document).await {
            tracing::warn!("Error sending acknowledgment to {}: {}", addr, e);
            break if e.is_reset() {
                CloseReason::Reset
            } else {
                CloseReason::SendFailed(e.to_string())
            };
        }

        tracing::debug!("Sent acknowledgment for '{}' to {}", document.name, addr);
    };

    conn.close().await;
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, FileStore, MemoryStore, StoreError, StoreResult};
    use crate::protocol::{encode_frame, recv_document, send_document};
    use bytes::BytesMut;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    /// Store that refuses every write
    struct FailingStore;

    #[async_trait]
    impl DocumentStore for FailingStore {
        async fn save(&self, _document: &Document) -> StoreResult<PathBuf> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }

        async fn load(&self, path: &Path) -> StoreResult<Document> {
            Err(StoreError::NotFound(path.to_path_buf()))
        }

        async fn list(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn loopback() -> NetworkConfig {
        NetworkConfig::new(0).with_bind_address("127.0.0.1")
    }

    async fn accepted_pair() -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer) = accepted.unwrap();
        (client.unwrap(), Connection::new(stream, peer))
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = StreamServer::new(loopback(), Arc::new(MemoryStore::new()));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_store_and_acknowledge() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        let mut server = StreamServer::new(loopback(), store);
        let addr = server.start().await.unwrap();
        assert!(server.is_running().await);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let document = Document::new("g1", "digraph {A->B}");
        send_document(&mut client, &document).await.unwrap();
        let ack = recv_document(&mut client).await.unwrap().unwrap();

        assert_eq!(ack, document);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("g1.dot")).unwrap(),
            "digraph {A->B}"
        );

        drop(client);
        server.stop().await.unwrap();
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_many_documents_on_one_connection() {
        let store = Arc::new(MemoryStore::new());
        let mut server = StreamServer::new(loopback(), store.clone());
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        for i in 0..3 {
            let document = Document::new(format!("g{}", i), format!("graph {{ {} }}", i));
            send_document(&mut client, &document).await.unwrap();
            assert_eq!(recv_document(&mut client).await.unwrap().unwrap(), document);
        }
        assert_eq!(store.len().await, 3);

        drop(client);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connections() {
        let store = Arc::new(MemoryStore::new());
        let mut server = StreamServer::new(loopback(), store.clone());
        let addr = server.start().await.unwrap();

        let mut clients = JoinSet::new();
        for i in 0..8 {
            clients.spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let document = Document::new(format!("c{}", i), "digraph {}");
                send_document(&mut client, &document).await.unwrap();
                recv_document(&mut client).await.unwrap().unwrap() == document
            });
        }
        while let Some(ok) = clients.join_next().await {
            assert!(ok.unwrap());
        }
        assert_eq!(store.len().await, 8);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let mut server = StreamServer::new(loopback(), Arc::new(MemoryStore::new()));
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = NetworkConfig::new(port).with_bind_address("127.0.0.1");
        let mut server = StreamServer::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(server.start().await, Err(ServerError::BindFailed(_))));
    }

    #[tokio::test]
    async fn test_events() {
        let mut server = StreamServer::new(loopback(), Arc::new(MemoryStore::new()));
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_document(&mut client, &Document::new("g", "graph {}")).await.unwrap();
        recv_document(&mut client).await.unwrap();
        drop(client);

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = matches!(event, ServerEvent::PeerDisconnected { .. });
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(matches!(seen[0], ServerEvent::Started { .. }));
        assert!(matches!(seen[1], ServerEvent::PeerConnected { .. }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::DocumentStored { name, .. } if name == "g")));
        assert!(matches!(
            seen.last(),
            Some(ServerEvent::PeerDisconnected { reason: CloseReason::PeerClosed, .. })
        ));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_connection_open() {
        let (mut client, mut conn) = accepted_pair().await;
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler = tokio::spawn(async move {
            handle_connection(&mut conn, &FailingStore, &event_tx, shutdown_rx).await
        });

        send_document(&mut client, &Document::new("g", "graph {}")).await.unwrap();
        let event = event_rx.recv().await.unwrap();
        assert!(matches!(event, ServerEvent::StorageFailed { ref name, .. } if name == "g"));

        // No acknowledgment arrives, but the connection is still served
        let pending =
            tokio::time::timeout(Duration::from_millis(100), recv_document(&mut client)).await;
        assert!(pending.is_err());

        send_document(&mut client, &Document::new("h", "graph {}")).await.unwrap();
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            ServerEvent::StorageFailed { .. }
        ));

        drop(client);
        assert_eq!(handler.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_protocol_violation_closes_connection() {
        let (mut client, mut conn) = accepted_pair().await;
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = MemoryStore::new();

        client.write_all(&0u32.to_be_bytes()).await.unwrap();
        let reason = handle_connection(&mut conn, &store, &event_tx, shutdown_rx).await;

        assert!(matches!(reason, CloseReason::Protocol(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let (_client, mut conn) = accepted_pair().await;
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = MemoryStore::new();

        let handler = tokio::spawn(async move {
            handle_connection(&mut conn, &store, &event_tx, shutdown_rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        assert_eq!(handler.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_mid_frame_finishes_document() {
        let (mut client, mut conn) = accepted_pair().await;
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = Arc::new(MemoryStore::new());

        let handler_store = store.clone();
        let handler = tokio::spawn(async move {
            handle_connection(&mut conn, handler_store.as_ref(), &event_tx, shutdown_rx).await
        });

        let document = Document::new("g1", "digraph {A->B}");
        let mut frame = BytesMut::new();
        encode_frame(&document, &mut frame).unwrap();
        let (head, tail) = frame.split_at(10);

        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(tail).await.unwrap();

        assert_eq!(recv_document(&mut client).await.unwrap().unwrap(), document);
        assert_eq!(handler.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(store.get("g1").await, Some(document));
    }
}
