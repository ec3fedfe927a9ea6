//! Stored records: live documents and deletion tombstones

use crate::types::Etag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Identifier as supplied by the writer
    pub id: String,
    /// Lower-cased identifier, the storage key
    pub lower_id: String,
    /// Collection name as supplied by the writer
    pub collection: String,
    /// Change sequence of the commit that wrote this version
    pub etag: Etag,
    /// Commit timestamp
    pub last_modified: DateTime<Utc>,
    /// Serialized size of `data` in bytes
    pub size: usize,
    /// Document body
    pub data: serde_json::Value,
}

impl Document {
    /// Normalized collection key
    pub fn collection_key(&self) -> String {
        self.collection.to_lowercase()
    }
}

/// Marker left behind by a delete so indexes can drop the document's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Identifier of the deleted document
    pub id: String,
    /// Lower-cased identifier
    pub lower_id: String,
    /// Collection the document belonged to
    pub collection: String,
    /// Change sequence of the delete
    pub etag: Etag,
    /// Etag of the document version that was deleted
    pub deleted_etag: Etag,
    /// Delete timestamp
    pub last_modified: DateTime<Utc>,
}

impl Tombstone {
    /// Normalized collection key
    pub fn collection_key(&self) -> String {
        self.collection.to_lowercase()
    }
}
