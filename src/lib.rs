//! dotwire - DOT document transfer over TCP and UDP
//!
//! A client hands a named DOT document to a server, which stores it and
//! echoes it back as the acknowledgment. Two transports are supported:
//! length-prefixed frames over a stream, and one envelope per datagram.

pub mod config;
pub mod document;
pub mod network;
pub mod protocol;
pub mod session;

pub use document::{Document, DocumentStore, FileStore};
pub use protocol::Envelope;
