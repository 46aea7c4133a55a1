//! Stream codec for the connection-oriented transport
//!
//! Frame layout: `[u32 length, big-endian][length bytes of JSON envelope]`.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{preview, Envelope, LENGTH_PREFIX_SIZE, MAX_BUFFER_SIZE, READ_CHUNK_SIZE};
use crate::document::Document;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    #[error("Connection closed mid-header after {0} of 4 bytes")]
    TruncatedHeader(usize),

    #[error("Empty message received")]
    EmptyMessage,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Connection closed mid-message after {received} of {expected} bytes")]
    TruncatedPayload { received: usize, expected: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message does not contain a document")]
    MissingDocument,

    #[error("Document has no content")]
    MissingContent,
}

impl CodecError {
    /// Whether the peer dropped the connection abruptly
    pub fn is_reset(&self) -> bool {
        match self {
            CodecError::Io(e) | CodecError::Send(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Append a complete frame carrying `document` to `buf`
pub fn encode_frame(document: &Document, buf: &mut BytesMut) -> CodecResult<()> {
    let payload = Envelope::data(document.clone()).to_bytes()?;

    let length = u32::try_from(payload.len())
        .map_err(|_| CodecError::MessageTooLarge(payload.len(), u32::MAX as usize))?;

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(length);
    buf.put_slice(&payload);
    Ok(())
}

/// Frame `document` and write it out in full.
///
/// Succeeds only once the prefix and the whole payload have been written.
pub async fn send_document<W>(writer: &mut W, document: &Document) -> CodecResult<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_frame(document, &mut buf)?;

    tracing::debug!(
        "Sending '{}' ({} byte payload): {}",
        document.name,
        buf.len() - LENGTH_PREFIX_SIZE,
        preview(&buf[LENGTH_PREFIX_SIZE..])
    );

    writer.write_all(&buf).await.map_err(CodecError::Send)?;
    writer.flush().await.map_err(CodecError::Send)?;

    Ok(buf.len())
}

/// Read the length prefix.
///
/// `Ok(None)` means the peer closed before sending anything.
async fn read_length<R>(reader: &mut R) -> CodecResult<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;

    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(CodecError::TruncatedHeader(filled))
            };
        }
        filled += n;
    }

    Ok(Some(u32::from_be_bytes(header) as usize))
}

/// Read exactly `length` bytes in chunks of at most [`READ_CHUNK_SIZE`]
async fn read_payload<R>(reader: &mut R, length: usize) -> CodecResult<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut payload = BytesMut::with_capacity(length);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while payload.len() < length {
        let want = (length - payload.len()).min(READ_CHUNK_SIZE);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(CodecError::TruncatedPayload {
                received: payload.len(),
                expected: length,
            });
        }
        payload.extend_from_slice(&chunk[..n]);
    }

    Ok(payload)
}

/// Decode a frame body into the document it carries
pub fn decode_payload(payload: &[u8]) -> CodecResult<Document> {
    let envelope = Envelope::from_bytes(payload).map_err(|e| {
        tracing::debug!("Undecodable payload: {}", preview(payload));
        CodecError::Malformed(e)
    })?;

    envelope.into_document().ok_or(CodecError::MissingDocument)
}

/// Receive one framed document.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new frame began. A zero or oversized length is rejected before any body
/// byte is read.
pub async fn recv_document<R>(reader: &mut R) -> CodecResult<Option<Document>>
where
    R: AsyncRead + Unpin,
{
    Ok(recv_frame(reader).await?.map(|(document, _)| document))
}

/// Like [`recv_document`], also returning the frame size including the prefix
pub async fn recv_frame<R>(reader: &mut R) -> CodecResult<Option<(Document, usize)>>
where
    R: AsyncRead + Unpin,
{
    let length = match read_length(reader).await? {
        Some(length) => length,
        None => return Ok(None),
    };

    if length == 0 {
        return Err(CodecError::EmptyMessage);
    }
    if length > MAX_BUFFER_SIZE {
        return Err(CodecError::MessageTooLarge(length, MAX_BUFFER_SIZE));
    }

    tracing::debug!("Receiving message of {} bytes", length);

    let payload = read_payload(reader, length).await?;
    let document = decode_payload(&payload)?;
    Ok(Some((document, LENGTH_PREFIX_SIZE + length)))
}
