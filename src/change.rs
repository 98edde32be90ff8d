// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notifications and documents.
//!
//! A [`ChangeNotification`] is one entry of the source's change stream. Once
//! it passes the filter stage it becomes an admitted document: its body with
//! the revision marker stripped and any transform applied.
//!
//! Documents are JSON objects. Two reserved fields matter here:
//!
//! - `_id`: the document identifier (filled from the notification if absent)
//! - `_rev`: the source's revision marker (always stripped, the target assigns its own)

use crate::error::{ReplicationError, Result};
use crate::sequence::Sequence;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;

/// A JSON document body.
pub type Document = Value;

/// Reserved field holding the document identifier.
pub const ID_FIELD: &str = "_id";

/// Reserved field holding the revision marker.
pub const REV_FIELD: &str = "_rev";

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// One entry of the source change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Position of this change in the source stream
    pub seq: Sequence,
    /// Document identifier
    pub id: String,
    /// Document body, when the feed includes documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    /// True when the change is a deletion
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeNotification {
    /// A change carrying a document body.
    pub fn new(seq: impl Into<Sequence>, id: impl Into<String>, doc: Document) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            doc: Some(doc),
            deleted: false,
        }
    }

    /// A deletion. The body, if any, is the tombstone.
    pub fn deletion(seq: impl Into<Sequence>, id: impl Into<String>, doc: Option<Document>) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            doc,
            deleted: true,
        }
    }

    /// A change without a body (feed subscribed without documents).
    pub fn bare(seq: impl Into<Sequence>, id: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            id: id.into(),
            doc: None,
            deleted: false,
        }
    }

    /// True when the notification carries a JSON object body.
    pub fn has_valid_body(&self) -> bool {
        matches!(self.doc, Some(Value::Object(_)))
    }

    /// Consume the notification into the document that will be written.
    ///
    /// Strips `_rev` and fills `_id` from the notification when missing.
    /// Returns `None` when the body is absent or not an object.
    pub fn into_admitted(self) -> Option<Document> {
        let id = self.id;
        match self.doc {
            Some(Value::Object(mut map)) => {
                map.remove(REV_FIELD);
                map.entry(ID_FIELD.to_string())
                    .or_insert_with(|| Value::String(id));
                Some(Value::Object(map))
            }
            _ => None,
        }
    }
}

/// Read the `_id` of a document, if it is a string.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// Decode a raw document payload: decompress, verify the optional hash, parse JSON.
pub fn decode_document(raw: &[u8], expected_hash: Option<&str>) -> Result<Document> {
    let data = maybe_decompress(raw)?;

    if let Some(expected) = expected_hash {
        let computed = content_hash(&data);
        if computed != expected {
            return Err(ReplicationError::StreamParse(format!(
                "Content hash mismatch: expected {}, got {}",
                expected, computed
            )));
        }
    }

    serde_json::from_slice(&data)
        .map_err(|e| ReplicationError::StreamParse(format!("Invalid document JSON: {}", e)))
}
