//! Identifiers shared across the storage and indexing layers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Change sequence assigned by the storage engine at commit.
///
/// Unique per store and strictly increasing in commit order. Not gapless per
/// collection.
pub type Etag = u64;

/// Reserved collection name that denotes every document in the store.
pub const ALL_DOCUMENTS_COLLECTION: &str = "@all_docs";

/// Comparable form of a document identifier.
pub fn lower_id(id: &str) -> String {
    id.to_lowercase()
}

/// Extraction scope: one named collection, or all of them.
///
/// Collection names compare case-insensitively; the original spelling is kept
/// for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Collection {
    /// Every document regardless of collection
    All,
    /// A single collection
    Named(String),
}

impl Collection {
    /// Build a scope from a collection name.
    ///
    /// The reserved `@all_docs` name maps to [`Collection::All`].
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.eq_ignore_ascii_case(ALL_DOCUMENTS_COLLECTION) {
            Collection::All
        } else {
            Collection::Named(name)
        }
    }

    /// True for the all-documents scope
    pub fn is_all(&self) -> bool {
        matches!(self, Collection::All)
    }

    /// Normalized key used by storage tables and watermarks.
    pub fn key(&self) -> String {
        match self {
            Collection::All => ALL_DOCUMENTS_COLLECTION.to_string(),
            Collection::Named(name) => name.to_lowercase(),
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        match self {
            Collection::All => ALL_DOCUMENTS_COLLECTION,
            Collection::Named(name) => name,
        }
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Collection {}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
