//! Read contract between the storage engine and the indexing pipeline
//!
//! The indexing layer never depends on how documents are laid out in storage;
//! it only needs etag-ordered cursors and the latest etag per collection, all
//! observed through one transaction snapshot.

use crate::document::{Document, Tombstone};
use crate::error::Result;
use crate::scope::ScopeToken;
use crate::types::{Collection, Etag};
use std::sync::Arc;

/// Lazy, etag-ordered cursor over stored records.
///
/// The cursor owns its snapshot and checks the transaction scope on every
/// step: once the transaction has ended it yields `Err(StaleContext)` once and
/// then stops.
pub type RecordIter<T> = Box<dyn Iterator<Item = Result<Arc<T>>> + Send>;

/// Snapshot read access to documents and tombstones.
///
/// Thread safety: implementations are read-only views and must be safe to
/// share between threads (requires Send + Sync).
pub trait DocumentSource: Send + Sync {
    /// Documents with `etag >= from_etag`, ascending by etag.
    ///
    /// `skip` records are dropped from the front and at most `take` are
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `StaleContext` if the transaction has already ended.
    fn documents_from(
        &self,
        collection: &Collection,
        from_etag: Etag,
        skip: usize,
        take: usize,
    ) -> Result<RecordIter<Document>>;

    /// Tombstones with `etag >= from_etag`, ascending by etag.
    ///
    /// # Errors
    ///
    /// Returns `StaleContext` if the transaction has already ended.
    fn tombstones_from(
        &self,
        collection: &Collection,
        from_etag: Etag,
        skip: usize,
        take: usize,
    ) -> Result<RecordIter<Tombstone>>;

    /// Highest document etag in the collection, 0 if empty
    fn last_document_etag(&self, collection: &Collection) -> Result<Etag>;

    /// Highest tombstone etag in the collection, 0 if none
    fn last_tombstone_etag(&self, collection: &Collection) -> Result<Etag>;

    /// Liveness token of the underlying transaction
    fn scope(&self) -> &ScopeToken;
}
