//! Protocol module - Defines the wire protocol for document transfer
//!
//! Every message is a UTF-8 JSON envelope:
//! `{"type": .., "command": .., "name": .., "dot": {"name": .., "content": ..}}`
//!
//! Over a stream the envelope is preceded by a 4-byte big-endian length.
//! Over datagrams one packet carries exactly one envelope.

mod message;
mod codec;
mod datagram;

pub use message::*;
pub use codec::*;
pub use datagram::*;

/// Largest accepted message body, in bytes, on either transport
pub const MAX_BUFFER_SIZE: usize = 65535;

/// Largest single read while accumulating a stream body
pub const READ_CHUNK_SIZE: usize = 4096;

/// Size of the stream length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default port for the stream transport
pub const DEFAULT_STREAM_PORT: u16 = 8080;

/// Default port for the datagram transport
pub const DEFAULT_DATAGRAM_PORT: u16 = 8081;

/// Envelope key holding the nested document
pub const DOCUMENT_KEY: &str = "dot";

/// Name substituted when a datagram carries a document without one
pub const UNNAMED_DOCUMENT: &str = "unnamed";

/// Number of payload bytes shown in debug previews
const PREVIEW_LEN: usize = 100;

/// Lossy UTF-8 preview of the head of a payload for logging
pub(crate) fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
