//! Persisted per-index state
//!
//! Every index owns three trees in the storage environment:
//!
//! | tree | key | value |
//! |------|-----|-------|
//! | `index/<name>/etags` | `doc:<collection>` / `tomb:<collection>` | watermark, u64 LE |
//! | `index/<name>/entries` | lower-cased document id | [`IndexEntry`], msgpack |
//! | `index/<name>/errors` | sequence, u64 BE | [`IndexingError`], msgpack |
//!
//! Watermarks only move forward. Entries are keyed by document id, so mapping
//! the same document again replaces its entry instead of adding a second one.

use crate::extractor::SourceKind;
use chrono::{DateTime, Utc};
use quarry_core::{Collection, Error, Etag, Result};
use quarry_storage::{TreeReader, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named fields produced by map logic for one document
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Stored map output of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Document id as written
    pub document_id: String,
    /// Collection the document belongs to
    pub collection: String,
    /// Etag of the document version that produced the entry
    pub etag: Etag,
    /// Mapped fields
    pub fields: Fields,
}

/// A recorded per-item map failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingError {
    /// Index name
    pub index: String,
    /// Document that failed to map
    pub document_id: String,
    /// Etag of the failing document version
    pub etag: Etag,
    /// Failure description
    pub message: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

pub(crate) fn etags_tree(index: &str) -> String {
    format!("index/{}/etags", index)
}

pub(crate) fn entries_tree(index: &str) -> String {
    format!("index/{}/entries", index)
}

pub(crate) fn errors_tree(index: &str) -> String {
    format!("index/{}/errors", index)
}

fn watermark_key(kind: SourceKind, collection: &Collection) -> Vec<u8> {
    let prefix = match kind {
        SourceKind::Document => "doc",
        SourceKind::Tombstone => "tomb",
    };
    format!("{}:{}", prefix, collection.key()).into_bytes()
}

/// Last processed etag of `kind` for the collection, 0 if never indexed.
pub fn read_watermark<R: TreeReader + ?Sized>(
    reader: &R,
    index: &str,
    kind: SourceKind,
    collection: &Collection,
) -> Result<Etag> {
    match reader.tree_get(&etags_tree(index), &watermark_key(kind, collection))? {
        None => Ok(0),
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                Error::corruption(format!(
                    "watermark of index '{}' has {} bytes, expected 8",
                    index,
                    bytes.len()
                ))
            })?;
            Ok(Etag::from_le_bytes(raw))
        }
    }
}

/// Advance a watermark inside `tx`.
///
/// # Errors
///
/// `InvalidOperation` if `etag` is below the current watermark.
pub fn write_watermark(
    tx: &mut WriteTransaction<'_>,
    index: &str,
    kind: SourceKind,
    collection: &Collection,
    etag: Etag,
) -> Result<()> {
    let current = read_watermark(&*tx, index, kind, collection)?;
    if etag < current {
        return Err(Error::invalid_operation(format!(
            "{} watermark of index '{}' for '{}' cannot move back from {} to {}",
            kind, index, collection, current, etag
        )));
    }
    tx.tree_put(
        &etags_tree(index),
        &watermark_key(kind, collection),
        etag.to_le_bytes().to_vec(),
    );
    Ok(())
}

/// Stored entry for a document, if any
pub fn read_entry<R: TreeReader + ?Sized>(
    reader: &R,
    index: &str,
    lower_id: &str,
) -> Result<Option<IndexEntry>> {
    reader
        .tree_get(&entries_tree(index), lower_id.as_bytes())?
        .map(|bytes| rmp_serde::from_slice(&bytes).map_err(Error::from))
        .transpose()
}

/// All stored entries keyed by lower-cased document id
pub fn read_entries<R: TreeReader + ?Sized>(
    reader: &R,
    index: &str,
) -> Result<Vec<(String, IndexEntry)>> {
    reader
        .tree_entries(&entries_tree(index))?
        .into_iter()
        .map(|(key, value)| {
            let key = String::from_utf8(key)
                .map_err(|_| Error::corruption(format!("non UTF-8 entry key in '{}'", index)))?;
            Ok((key, rmp_serde::from_slice(&value)?))
        })
        .collect()
}

pub(crate) fn put_entry(
    tx: &mut WriteTransaction<'_>,
    index: &str,
    lower_id: &str,
    entry: &IndexEntry,
) -> Result<()> {
    let bytes = rmp_serde::to_vec(entry)?;
    tx.tree_put(&entries_tree(index), lower_id.as_bytes(), bytes);
    Ok(())
}

pub(crate) fn remove_entry(tx: &mut WriteTransaction<'_>, index: &str, lower_id: &str) {
    tx.tree_delete(&entries_tree(index), lower_id.as_bytes());
}

/// Append to the error log, keeping at most `max_stored` of the newest.
pub(crate) fn append_error(
    tx: &mut WriteTransaction<'_>,
    error: &IndexingError,
    max_stored: usize,
) -> Result<()> {
    let tree = errors_tree(&error.index);
    let existing = tx.tree_entries(&tree)?;
    let next_seq = match existing.last() {
        Some((key, _)) => {
            let raw: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| Error::corruption(format!("bad error log key in '{}'", tree)))?;
            u64::from_be_bytes(raw) + 1
        }
        None => 0,
    };
    if max_stored == 0 {
        return Ok(());
    }
    tx.tree_put(&tree, &next_seq.to_be_bytes(), rmp_serde::to_vec(error)?);

    let overflow = (existing.len() + 1).saturating_sub(max_stored);
    for (key, _) in existing.iter().take(overflow) {
        tx.tree_delete(&tree, key);
    }
    Ok(())
}

/// Recorded errors, oldest first
pub fn read_errors<R: TreeReader + ?Sized>(reader: &R, index: &str) -> Result<Vec<IndexingError>> {
    reader
        .tree_entries(&errors_tree(index))?
        .into_iter()
        .map(|(_, value)| rmp_serde::from_slice(&value).map_err(Error::from))
        .collect()
}

/// Remove all persisted state of an index
pub(crate) fn drop_index_state(tx: &mut WriteTransaction<'_>, index: &str) {
    tx.drop_tree(&etags_tree(index));
    tx.drop_tree(&entries_tree(index));
    tx.drop_tree(&errors_tree(index));
}
