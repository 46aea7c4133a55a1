//! Datagram codec for the connectionless transport
//!
//! One datagram carries one JSON envelope; the packet boundary is the
//! message boundary, so there is no length prefix.
//!
//! Two decode paths exist on purpose. [`decode_datagram`] goes through the
//! permissive envelope decoder and reports failures as an absent document.
//! [`decode_dispatch_record`] is what the server loop uses: it reads the raw
//! record directly, fails hard on bad JSON, and fills in a default name.

use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use super::{
    preview, CodecError, CodecResult, Envelope, DOCUMENT_KEY, MAX_BUFFER_SIZE, UNNAMED_DOCUMENT,
};
use crate::document::Document;

fn check_size(bytes: Vec<u8>) -> CodecResult<Vec<u8>> {
    if bytes.len() > MAX_BUFFER_SIZE {
        return Err(CodecError::MessageTooLarge(bytes.len(), MAX_BUFFER_SIZE));
    }
    Ok(bytes)
}

/// Serialize a data envelope for `document` into one datagram body
pub fn encode_datagram(document: &Document) -> CodecResult<Vec<u8>> {
    check_size(Envelope::data(document.clone()).to_bytes()?)
}

/// Serialize the acknowledgment the dispatch loop sends back
pub fn encode_acknowledgment(document: &Document) -> CodecResult<Vec<u8>> {
    Ok(Envelope::acknowledge(document.clone()).to_bytes()?)
}

/// Send `document` to `destination` as a single datagram.
///
/// Oversized envelopes are rejected before anything is transmitted.
pub async fn send_datagram(
    socket: &UdpSocket,
    destination: SocketAddr,
    document: &Document,
) -> CodecResult<usize> {
    let bytes = encode_datagram(document)?;

    tracing::debug!("Sending {} bytes to {}", bytes.len(), destination);

    let sent = socket
        .send_to(&bytes, destination)
        .await
        .map_err(CodecError::Send)?;
    Ok(sent)
}

/// Permissive decode: any failure yields `None`
pub fn decode_datagram(bytes: &[u8]) -> Option<Document> {
    match Envelope::from_bytes(bytes) {
        Ok(envelope) => envelope.into_document(),
        Err(e) => {
            tracing::debug!("Undecodable datagram ({}): {}", e, preview(bytes));
            None
        }
    }
}

/// Receive one datagram and decode it permissively.
///
/// Only socket errors are returned; an undecodable datagram comes back as
/// `(None, source)` so receive loops can skip it and carry on.
pub async fn recv_datagram(socket: &UdpSocket) -> io::Result<(Option<Document>, SocketAddr)> {
    let mut buf = vec![0u8; MAX_BUFFER_SIZE];
    let (n, source) = socket.recv_from(&mut buf).await?;

    tracing::debug!("Received {} bytes from {}", n, source);

    Ok((decode_datagram(&buf[..n]), source))
}

/// Strict decode of a raw datagram record for the dispatch loop.
///
/// Invalid JSON is an error. A missing or empty document sub-record and a
/// missing or empty `content` are errors. A missing, empty, or non-string
/// `name` becomes [`UNNAMED_DOCUMENT`].
pub fn decode_dispatch_record(bytes: &[u8]) -> CodecResult<Document> {
    let record: Value = serde_json::from_slice(bytes)?;

    let document = record
        .get(DOCUMENT_KEY)
        .filter(|value| match value {
            Value::Object(map) => !map.is_empty(),
            _ => false,
        })
        .ok_or(CodecError::MissingDocument)?;

    let name = match document.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            tracing::warn!("No name in document, using '{}'", UNNAMED_DOCUMENT);
            UNNAMED_DOCUMENT.to_string()
        }
    };

    let content = document
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .ok_or(CodecError::MissingContent)?;

    Ok(Document::new(name, content))
}
