//! Interactive client session
//!
//! Reads line commands (`send <path>`, `exit`), pushes documents through a
//! [`DocumentTransport`] and keeps acknowledged copies in local storage.
//! Failures are reported on the output and the prompt comes back.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::document::{DocumentStore, StoreError};
use crate::network::{ClientError, DocumentTransport};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Error loading document: {0}")]
    Load(#[source] StoreError),

    #[error("Error sending document: {0}")]
    Transport(#[from] ClientError),

    #[error("Error saving document locally: {0}")]
    Save(#[source] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send the document at this path
    Send(PathBuf),
    /// Leave the session
    Exit,
    /// Blank line
    Empty,
    /// Anything else, with a hint for the user
    Invalid(String),
}

/// Parse one input line
pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if line == "exit" {
        return Command::Exit;
    }

    match line.split_once(' ') {
        Some(("send", path)) if !path.trim().is_empty() => Command::Send(PathBuf::from(path.trim())),
        Some((_, _)) => Command::Invalid("Unknown command. Use 'send <file>' or 'exit'".to_string()),
        None => Command::Invalid("Invalid command format. Use 'send <file>'".to_string()),
    }
}

/// What happened to a sent document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Acknowledged and saved locally at `path`
    Saved { name: String, path: PathBuf },
    /// Sent, but nothing came back
    NoAcknowledgment { name: String },
}

/// Interactive session over one transport
pub struct Session<T> {
    transport: T,
    store: Arc<dyn DocumentStore>,
}

impl<T: DocumentTransport> Session<T> {
    pub fn new(transport: T, store: Arc<dyn DocumentStore>) -> Self {
        Self { transport, store }
    }

    /// Load, send, and store the acknowledged copy of one document
    pub async fn send_file(&mut self, path: &Path) -> SessionResult<SendOutcome> {
        let document = self.store.load(path).await.map_err(SessionError::Load)?;
        tracing::debug!(
            "Loaded '{}' ({} bytes) from {}",
            document.name,
            document.len(),
            path.display()
        );

        let ack = match self.transport.exchange(&document).await? {
            Some(ack) => ack,
            None => return Ok(SendOutcome::NoAcknowledgment { name: document.name }),
        };

        let path = self.store.save(&ack).await.map_err(SessionError::Save)?;
        Ok(SendOutcome::Saved {
            name: ack.name,
            path,
        })
    }

    /// Run the prompt until `exit` or end of input
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        loop {
            output.write_all(b"> ").await?;
            output.flush().await?;

            let line = match lines.next_line().await? {
                Some(line) => line,
                None => break,
            };

            let message = match parse_command(&line) {
                Command::Empty => continue,
                Command::Exit => {
                    output.write_all(b"Goodbye!\n").await?;
                    break;
                }
                Command::Invalid(hint) => hint,
                Command::Send(path) => match self.send_file(&path).await {
                    Ok(SendOutcome::Saved { name, .. }) => {
                        format!("Sent '{}', saved acknowledgment locally", name)
                    }
                    Ok(SendOutcome::NoAcknowledgment { name }) => {
                        format!("Sent '{}', no acknowledgment", name)
                    }
                    Err(e) => {
                        tracing::debug!("Send of {} failed: {:?}", path.display(), e);
                        e.to_string()
                    }
                },
            };

            output.write_all(message.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }

        output.flush().await
    }
}
