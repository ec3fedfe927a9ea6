//! Index item extraction
//!
//! Pulls records committed after a watermark out of a read transaction, one
//! page at a time, and normalizes them into [`IndexItem`]s. The source kind
//! (live documents or deletion tombstones) is chosen once, when the extractor
//! is built; the per-item path has no kind dispatch beyond the page's own
//! variant.
//!
//! Pages are lazy and own their snapshot handle. An item or page that outlives
//! its transaction reports `StaleContext` instead of reading released state.

use chrono::{DateTime, Utc};
use quarry_core::{
    Collection, Document, DocumentSource, Error, Etag, RecordIter, Result, ScopeToken, Tombstone,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Where an item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// A live document version
    Document,
    /// The marker left by a delete
    Tombstone,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Document => f.write_str("document"),
            SourceKind::Tombstone => f.write_str("tombstone"),
        }
    }
}

enum ItemRecord {
    Document(Arc<Document>),
    Tombstone(Arc<Tombstone>),
}

/// Normalized view of one stored record, ready for map logic.
///
/// Identity fields are copied out and stay readable forever; the record
/// itself is only reachable while the originating transaction is open.
pub struct IndexItem {
    id: String,
    lower_id: String,
    collection: String,
    etag: Etag,
    last_modified: DateTime<Utc>,
    size: usize,
    record: ItemRecord,
    scope: ScopeToken,
}

impl IndexItem {
    fn from_document(document: Arc<Document>, scope: ScopeToken) -> Self {
        Self {
            id: document.id.clone(),
            lower_id: document.lower_id.clone(),
            collection: document.collection.clone(),
            etag: document.etag,
            last_modified: document.last_modified,
            size: document.size,
            record: ItemRecord::Document(document),
            scope,
        }
    }

    fn from_tombstone(tombstone: Arc<Tombstone>, scope: ScopeToken) -> Self {
        Self {
            id: tombstone.id.clone(),
            lower_id: tombstone.lower_id.clone(),
            collection: tombstone.collection.clone(),
            etag: tombstone.etag,
            last_modified: tombstone.last_modified,
            size: 0,
            record: ItemRecord::Tombstone(tombstone),
            scope,
        }
    }

    /// Identifier as written
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lower-cased identifier
    pub fn lower_id(&self) -> &str {
        &self.lower_id
    }

    /// Collection name as written
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Change sequence of the record
    pub fn etag(&self) -> Etag {
        self.etag
    }

    /// Commit timestamp of the record
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Always `None`: documents and tombstones are never reduce results.
    pub fn reduce_key_hash(&self) -> Option<u64> {
        None
    }

    /// Serialized document size in bytes, 0 for tombstones
    pub fn size(&self) -> usize {
        self.size
    }

    /// Source kind
    pub fn kind(&self) -> SourceKind {
        match self.record {
            ItemRecord::Document(_) => SourceKind::Document,
            ItemRecord::Tombstone(_) => SourceKind::Tombstone,
        }
    }

    /// The underlying document.
    ///
    /// # Errors
    ///
    /// - `StaleContext` once the read transaction has ended
    /// - `InvalidOperation` for a tombstone item
    pub fn document(&self) -> Result<&Document> {
        self.scope.ensure_live()?;
        match &self.record {
            ItemRecord::Document(document) => Ok(document),
            ItemRecord::Tombstone(_) => Err(Error::invalid_operation(format!(
                "item '{}' is a tombstone",
                self.id
            ))),
        }
    }

    /// The underlying tombstone.
    ///
    /// # Errors
    ///
    /// - `StaleContext` once the read transaction has ended
    /// - `InvalidOperation` for a document item
    pub fn tombstone(&self) -> Result<&Tombstone> {
        self.scope.ensure_live()?;
        match &self.record {
            ItemRecord::Tombstone(tombstone) => Ok(tombstone),
            ItemRecord::Document(_) => Err(Error::invalid_operation(format!(
                "item '{}' is a document",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for IndexItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexItem")
            .field("id", &self.id)
            .field("etag", &self.etag)
            .field("kind", &self.kind())
            .field("size", &self.size)
            .finish()
    }
}

/// Builds pages of [`IndexItem`]s of one source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemExtractor {
    kind: SourceKind,
}

impl ItemExtractor {
    /// Extract live documents
    pub fn documents() -> Self {
        Self::for_kind(SourceKind::Document)
    }

    /// Extract deletion tombstones
    pub fn tombstones() -> Self {
        Self::for_kind(SourceKind::Tombstone)
    }

    /// Extract records of `kind`
    pub fn for_kind(kind: SourceKind) -> Self {
        Self { kind }
    }

    /// Kind this extractor reads
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Items with `etag > since_etag`, ascending, at most `page_size` of them.
    ///
    /// `page_size` of `None` means unbounded. The page is lazy: records are
    /// read from `source` as the page is iterated.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a page size of 0
    /// - `StaleContext` if the transaction has already ended
    pub fn next_page<S>(
        &self,
        source: &S,
        collection: &Collection,
        since_etag: Etag,
        page_size: Option<usize>,
    ) -> Result<ItemPage>
    where
        S: DocumentSource + ?Sized,
    {
        let take = match page_size {
            Some(0) => return Err(Error::invalid_input("page size must be at least 1")),
            Some(n) => n,
            None => usize::MAX,
        };
        let scope = source.scope().clone();
        scope.ensure_live()?;
        let Some(from) = since_etag.checked_add(1) else {
            return Ok(ItemPage {
                records: PageRecords::Exhausted,
                scope,
            });
        };
        let records = match self.kind {
            SourceKind::Document => {
                PageRecords::Documents(source.documents_from(collection, from, 0, take)?)
            }
            SourceKind::Tombstone => {
                PageRecords::Tombstones(source.tombstones_from(collection, from, 0, take)?)
            }
        };
        Ok(ItemPage { records, scope })
    }
}

enum PageRecords {
    Documents(RecordIter<Document>),
    Tombstones(RecordIter<Tombstone>),
    Exhausted,
}

/// One lazily-read page of items.
///
/// Yields `Err(StaleContext)` once if pulled after its transaction ended, and
/// nothing after any error.
pub struct ItemPage {
    records: PageRecords,
    scope: ScopeToken,
}

impl Iterator for ItemPage {
    type Item = Result<IndexItem>;

    fn next(&mut self) -> Option<Self::Item> {
        let scope = &self.scope;
        let next = match &mut self.records {
            PageRecords::Documents(iter) => iter
                .next()
                .map(|r| r.map(|doc| IndexItem::from_document(doc, scope.clone()))),
            PageRecords::Tombstones(iter) => iter
                .next()
                .map(|r| r.map(|t| IndexItem::from_tombstone(t, scope.clone()))),
            PageRecords::Exhausted => None,
        };
        match next {
            Some(Err(e)) => {
                self.records = PageRecords::Exhausted;
                Some(Err(e))
            }
            None => {
                self.records = PageRecords::Exhausted;
                None
            }
            item => item,
        }
    }
}

impl fmt::Debug for ItemPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.records {
            PageRecords::Documents(_) => "documents",
            PageRecords::Tombstones(_) => "tombstones",
            PageRecords::Exhausted => "exhausted",
        };
        f.debug_struct("ItemPage").field("records", &kind).finish()
    }
}
