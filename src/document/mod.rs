//! Document module - The unit of exchange
//!
//! A document is a named DOT graph description. The name doubles as the
//! storage key and filename stem; the content is carried verbatim.

mod store;

pub use store::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Document errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Malformed document record: missing or invalid `{0}`")]
    MalformedRecord(&'static str),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A named DOT document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier, used as storage key and filename stem
    pub name: String,
    /// Graph description text (may be empty)
    pub content: String,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Convert into a `{name, content}` record
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("name".to_string(), Value::String(self.name.clone()));
        record.insert("content".to_string(), Value::String(self.content.clone()));
        Value::Object(record)
    }

    /// Build a document from a `{name, content}` record.
    ///
    /// Both keys must be present and hold strings. Empty content is accepted.
    pub fn from_record(record: &Value) -> DocumentResult<Self> {
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .ok_or(DocumentError::MalformedRecord("name"))?;
        let content = record
            .get("content")
            .and_then(Value::as_str)
            .ok_or(DocumentError::MalformedRecord("content"))?;

        Ok(Self::new(name, content))
    }

    /// Content length in bytes
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
