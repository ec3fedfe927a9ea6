//! Core types and traits for Quarry
//!
//! This crate defines the foundational types shared by the storage engine and
//! the indexing pipeline:
//! - Etag: monotonically increasing change sequence assigned at commit
//! - Collection: a named collection or the "all documents" scope
//! - Document / Tombstone: stored records ordered by etag
//! - ScopeToken: liveness flag of a transaction
//! - Error: error taxonomy for storage, extraction and mapped reads
//! - DocumentSource: the read contract the indexing pipeline consumes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod scope;
pub mod traits;
pub mod types;

pub use document::{Document, Tombstone};
pub use error::{Error, Result};
pub use scope::ScopeToken;
pub use traits::{DocumentSource, RecordIter};
pub use types::{lower_id, Collection, Etag, ALL_DOCUMENTS_COLLECTION};
