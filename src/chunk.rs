//! Stream chunks
//!
//! A stream carries either bytes (optionally decoded to text) or arbitrary
//! values. Which one is fixed when the stream is built (`object_mode`), so the
//! engine never has to inspect a chunk's type at runtime beyond this tag.

use bytes::Bytes;
use serde_json::Value;

/// A unit of data moving through a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Raw bytes (byte mode)
    Bytes(Bytes),
    /// Decoded or not-yet-encoded text (byte mode)
    Text(String),
    /// An arbitrary value (object mode)
    Object(Value),
}

impl Chunk {
    /// Size of the chunk in byte mode: bytes for `Bytes`, characters for
    /// `Text`, 1 for `Object`
    pub fn len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.chars().count(),
            Chunk::Object(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Chunk::Bytes(b) => b.is_empty(),
            Chunk::Text(s) => s.is_empty(),
            Chunk::Object(_) => false,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Chunk::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Value> {
        match self {
            Chunk::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Payload as bytes; text is taken as UTF-8, objects are serialized
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Chunk::Bytes(b) => b.clone(),
            Chunk::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Chunk::Object(v) => Bytes::from(v.to_string()),
        }
    }

    /// Whether this is the object-mode null value, which may not be written
    pub(crate) fn is_null_value(&self) -> bool {
        matches!(self, Chunk::Object(Value::Null))
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Bytes(b)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(v: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for Chunk {
    fn from(s: &[u8]) -> Self {
        Chunk::Bytes(Bytes::copy_from_slice(s))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_owned())
    }
}

impl From<Value> for Chunk {
    fn from(v: Value) -> Self {
        Chunk::Object(v)
    }
}
