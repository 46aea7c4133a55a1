//! Protocol envelope
//!
//! The envelope wraps an optional document with routing metadata. Decoding
//! is permissive: missing fields take their defaults and a broken document
//! sub-record is treated as absent.

use serde_json::{Map, Value};

use super::DOCUMENT_KEY;
use crate::document::Document;

/// Default envelope type tag
pub const DATA_TYPE: &str = "data";

/// Command carried by acknowledgments
pub const ACKNOWLEDGE_COMMAND: &str = "acknowledge";

/// Typed wrapper carrying a document across the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Type tag, `"data"` unless stated otherwise
    pub kind: String,
    /// Command, empty for a plain data push
    pub command: String,
    /// Name, normally mirrors the carried document's name
    pub name: String,
    /// Carried document, absent for command-only messages
    pub document: Option<Document>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            kind: DATA_TYPE.to_string(),
            command: String::new(),
            name: String::new(),
            document: None,
        }
    }
}

impl Envelope {
    /// Plain data push carrying a document
    pub fn data(document: Document) -> Self {
        Self {
            document: Some(document),
            ..Default::default()
        }
    }

    /// Acknowledgment echoing a received document
    pub fn acknowledge(document: Document) -> Self {
        Self {
            command: ACKNOWLEDGE_COMMAND.to_string(),
            name: document.name.clone(),
            document: Some(document),
            ..Default::default()
        }
    }

    /// Command-only message without a document
    pub fn command(command: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Take the carried document, dropping the envelope
    pub fn into_document(self) -> Option<Document> {
        self.document
    }

    /// Convert into a structured record.
    ///
    /// The document key is omitted entirely when there is no document.
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("type".to_string(), Value::String(self.kind.clone()));
        record.insert("command".to_string(), Value::String(self.command.clone()));
        record.insert("name".to_string(), Value::String(self.name.clone()));
        if let Some(document) = &self.document {
            record.insert(DOCUMENT_KEY.to_string(), document.to_record());
        }
        Value::Object(record)
    }

    /// Build an envelope from a structured record. Never fails.
    pub fn from_record(record: &Value) -> Self {
        let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);

        let document = record
            .get(DOCUMENT_KEY)
            .filter(|value| !value.is_null())
            .and_then(|value| match Document::from_record(value) {
                Ok(document) => Some(document),
                Err(e) => {
                    tracing::debug!("Ignoring document sub-record: {}", e);
                    None
                }
            });

        Self {
            kind: text("type").unwrap_or_else(|| DATA_TYPE.to_string()),
            command: text("command").unwrap_or_default(),
            name: text("name").unwrap_or_default(),
            document,
        }
    }

    /// Serialize to UTF-8 JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_record())
    }

    /// Parse UTF-8 JSON bytes, then decode permissively.
    ///
    /// Only invalid JSON (including invalid UTF-8) is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let record: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_record(&record))
    }
}
