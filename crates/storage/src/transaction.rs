//! Read and write transactions
//!
//! A `ReadTransaction` pins one committed `EnvState` and never blocks. A
//! `WriteTransaction` holds the environment's writer lock for its whole
//! lifetime, buffers its operations, and publishes them in `commit`.
//!
//! # Scope
//!
//! Both transaction kinds own a `ScopeToken`. Cursors, mapped regions and any
//! other value derived from a transaction keep a clone of the token; `Drop`
//! closes it before the pinned snapshot is released, so derived values fail
//! with `StaleContext` / `AlreadyDisposed` instead of outliving the
//! transaction.

use crate::environment::{Environment, WriterState};
use crate::journal::JournalRecord;
use crate::mapped::{MappedRegion, RegionBacking};
use crate::state::{EnvState, EtagRecord, EtagTable, WalOp};
use chrono::Utc;
use parking_lot::MutexGuard;
use quarry_core::{
    lower_id, Collection, Document, DocumentSource, Error, Etag, RecordIter, Result, ScopeToken,
    Tombstone, ALL_DOCUMENTS_COLLECTION,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Read access to named key/value trees.
///
/// Implemented by both transaction kinds so metadata helpers work inside
/// either one.
pub trait TreeReader {
    /// Value stored under `key`, if any
    fn tree_get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries of the tree in key order (empty for a missing tree)
    fn tree_entries(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

// ============================================================================
// Read transaction
// ============================================================================

/// Snapshot view of the environment.
///
/// Cheap to open: clones one `Arc`. Sees exactly the state committed before it
/// was opened.
pub struct ReadTransaction {
    state: Arc<EnvState>,
    scope: ScopeToken,
}

impl ReadTransaction {
    pub(crate) fn new(state: Arc<EnvState>) -> Self {
        Self {
            state,
            scope: ScopeToken::new(),
        }
    }

    /// Id of the last transaction visible in this snapshot
    pub fn tx_id(&self) -> u64 {
        self.state.last_tx_id
    }

    /// Highest etag assigned in this snapshot (documents and tombstones)
    pub fn last_etag(&self) -> Etag {
        self.state.last_etag
    }

    /// Live document by id (case-insensitive)
    pub fn document(&self, id: &str) -> Option<Arc<Document>> {
        self.state.documents.get(&lower_id(id)).cloned()
    }

    /// Tombstone left by the delete of `id`, if any
    pub fn tombstone(&self, id: &str) -> Option<Arc<Tombstone>> {
        self.state.tombstones.get(&lower_id(id)).cloned()
    }

    /// Number of live documents in the collection
    pub fn count_documents(&self, collection: &Collection) -> usize {
        self.state.documents.count(&collection.key())
    }

    /// Keys of every collection that currently holds documents
    pub fn collections(&self) -> Vec<String> {
        self.state.documents.collections().cloned().collect()
    }

    /// Segment blob by name, valid only while this transaction is open.
    pub fn segment(&self, name: &str) -> Result<Option<MappedRegion>> {
        self.scope.ensure_live()?;
        Ok(self
            .state
            .segments
            .get(name)
            .map(|entry| MappedRegion::new(Arc::clone(&entry.backing), self.scope.clone())))
    }

    /// Names of all published segments
    pub fn segment_names(&self) -> Vec<String> {
        self.state.segments.keys().cloned().collect()
    }
}

impl DocumentSource for ReadTransaction {
    fn documents_from(
        &self,
        collection: &Collection,
        from_etag: Etag,
        skip: usize,
        take: usize,
    ) -> Result<RecordIter<Document>> {
        self.scope.ensure_live()?;
        Ok(Box::new(EtagCursor::new(
            Arc::clone(&self.state.documents),
            collection.key(),
            from_etag,
            skip,
            take,
            self.scope.clone(),
        )))
    }

    fn tombstones_from(
        &self,
        collection: &Collection,
        from_etag: Etag,
        skip: usize,
        take: usize,
    ) -> Result<RecordIter<Tombstone>> {
        self.scope.ensure_live()?;
        Ok(Box::new(EtagCursor::new(
            Arc::clone(&self.state.tombstones),
            collection.key(),
            from_etag,
            skip,
            take,
            self.scope.clone(),
        )))
    }

    fn last_document_etag(&self, collection: &Collection) -> Result<Etag> {
        self.scope.ensure_live()?;
        Ok(self.state.documents.last_etag(&collection.key()))
    }

    fn last_tombstone_etag(&self, collection: &Collection) -> Result<Etag> {
        self.scope.ensure_live()?;
        Ok(self.state.tombstones.last_etag(&collection.key()))
    }

    fn scope(&self) -> &ScopeToken {
        &self.scope
    }
}

impl TreeReader for ReadTransaction {
    fn tree_get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.scope.ensure_live()?;
        Ok(self
            .state
            .trees
            .get(tree)
            .and_then(|t| t.get(key))
            .cloned())
    }

    fn tree_entries(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scope.ensure_live()?;
        Ok(self
            .state
            .trees
            .get(tree)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        // Fields drop after this body, so the snapshot outlives the close.
        self.scope.close();
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("tx_id", &self.state.last_tx_id)
            .field("last_etag", &self.state.last_etag)
            .finish()
    }
}

/// Lazy etag-ordered cursor owning its table snapshot.
///
/// Each step looks up the first entry at or above `next_from`, so the cursor
/// holds no borrow into the table between calls.
struct EtagCursor<T> {
    table: Arc<EtagTable<T>>,
    collection_key: String,
    next_from: Option<Etag>,
    skip: usize,
    remaining: usize,
    scope: ScopeToken,
}

impl<T> EtagCursor<T> {
    fn new(
        table: Arc<EtagTable<T>>,
        collection_key: String,
        from_etag: Etag,
        skip: usize,
        take: usize,
        scope: ScopeToken,
    ) -> Self {
        Self {
            table,
            collection_key,
            next_from: Some(from_etag),
            skip,
            remaining: take,
            scope,
        }
    }
}

impl<T: EtagRecord> Iterator for EtagCursor<T> {
    type Item = Result<Arc<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut from = self.next_from?;
        if !self.scope.is_live() {
            self.next_from = None;
            return Some(Err(Error::StaleContext));
        }
        loop {
            if self.remaining == 0 {
                self.next_from = None;
                return None;
            }
            let found = self
                .table
                .ordered(&self.collection_key)
                .and_then(|entries| entries.range(from..).next())
                .map(|(etag, record)| (*etag, Arc::clone(record)));
            let Some((etag, record)) = found else {
                self.next_from = None;
                return None;
            };
            self.next_from = etag.checked_add(1);
            if self.skip > 0 {
                self.skip -= 1;
                from = self.next_from?;
                continue;
            }
            self.remaining -= 1;
            return Some(Ok(record));
        }
    }
}

// ============================================================================
// Write transaction
// ============================================================================

/// The single writer of an environment.
///
/// Holds the writer lock until committed or dropped. Writes are buffered and
/// visible to this transaction's own reads; nothing is visible to readers
/// until [`commit`](Self::commit) returns. Dropping without committing rolls
/// back.
pub struct WriteTransaction<'env> {
    env: &'env Environment,
    writer: MutexGuard<'env, WriterState>,
    base: Arc<EnvState>,
    tx_id: u64,
    next_etag: Etag,
    ops: Vec<WalOp>,
    documents: BTreeMap<String, Option<Arc<Document>>>,
    trees: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    dropped_trees: BTreeSet<String>,
    segments: BTreeMap<String, Option<SegmentWrite>>,
    scope: ScopeToken,
    committed: bool,
}

/// Buffered segment blob and the file it will be written to
struct SegmentWrite {
    file: String,
    backing: Arc<RegionBacking>,
}

impl<'env> WriteTransaction<'env> {
    pub(crate) fn new(
        env: &'env Environment,
        writer: MutexGuard<'env, WriterState>,
        base: Arc<EnvState>,
    ) -> Self {
        let tx_id = base.last_tx_id + 1;
        let next_etag = base.last_etag + 1;
        Self {
            env,
            writer,
            base,
            tx_id,
            next_etag,
            ops: Vec::new(),
            documents: BTreeMap::new(),
            trees: BTreeMap::new(),
            dropped_trees: BTreeSet::new(),
            segments: BTreeMap::new(),
            scope: ScopeToken::new(),
            committed: false,
        }
    }

    fn base(&self) -> &EnvState {
        &self.base
    }

    /// Id this transaction will commit as
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    /// Liveness token of this transaction
    pub fn scope(&self) -> &ScopeToken {
        &self.scope
    }

    /// Number of buffered operations
    pub fn pending_operations(&self) -> usize {
        self.ops.len()
    }

    fn take_etag(&mut self) -> Etag {
        let etag = self.next_etag;
        self.next_etag += 1;
        etag
    }

    /// Current version of a document, including this transaction's writes.
    pub fn document(&self, id: &str) -> Option<Arc<Document>> {
        let lower = lower_id(id);
        match self.documents.get(&lower) {
            Some(pending) => pending.clone(),
            None => self.base().documents.get(&lower).cloned(),
        }
    }

    /// Store a new version of a document and return its etag.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for an empty id or a missing/reserved collection name
    /// - `InvalidOperation` if the id already exists in a different collection
    pub fn put_document(
        &mut self,
        id: &str,
        collection: &str,
        data: serde_json::Value,
    ) -> Result<Etag> {
        if id.is_empty() {
            return Err(Error::invalid_input("document id must not be empty"));
        }
        if collection.is_empty() || collection.eq_ignore_ascii_case(ALL_DOCUMENTS_COLLECTION) {
            return Err(Error::invalid_input(format!(
                "'{}' is not a valid collection name",
                collection
            )));
        }
        if let Some(existing) = self.document(id) {
            if existing.collection_key() != collection.to_lowercase() {
                return Err(Error::invalid_operation(format!(
                    "document '{}' belongs to collection '{}', cannot move it to '{}'",
                    id, existing.collection, collection
                )));
            }
        }

        let size = serde_json::to_vec(&data)?.len();
        let etag = self.take_etag();
        let document = Document {
            id: id.to_string(),
            lower_id: lower_id(id),
            collection: collection.to_string(),
            etag,
            last_modified: Utc::now(),
            size,
            data,
        };
        self.documents
            .insert(document.lower_id.clone(), Some(Arc::new(document.clone())));
        self.ops.push(WalOp::PutDocument(document));
        Ok(etag)
    }

    /// Delete a document, leaving a tombstone. Returns the tombstone's etag,
    /// or `None` if the document did not exist.
    pub fn delete_document(&mut self, id: &str) -> Result<Option<Etag>> {
        let Some(existing) = self.document(id) else {
            return Ok(None);
        };
        let etag = self.take_etag();
        let tombstone = Tombstone {
            id: existing.id.clone(),
            lower_id: existing.lower_id.clone(),
            collection: existing.collection.clone(),
            etag,
            deleted_etag: existing.etag,
            last_modified: Utc::now(),
        };
        self.documents.insert(existing.lower_id.clone(), None);
        self.ops.push(WalOp::DeleteDocument(tombstone));
        Ok(Some(etag))
    }

    /// Insert or replace a tree entry
    pub fn tree_put(&mut self, tree: &str, key: &[u8], value: Vec<u8>) {
        self.trees
            .entry(tree.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value.clone()));
        self.ops.push(WalOp::PutTree {
            tree: tree.to_string(),
            key: key.to_vec(),
            value,
        });
    }

    /// Remove a tree entry (no-op if absent)
    pub fn tree_delete(&mut self, tree: &str, key: &[u8]) {
        self.trees
            .entry(tree.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        self.ops.push(WalOp::DeleteTree {
            tree: tree.to_string(),
            key: key.to_vec(),
        });
    }

    /// Remove a whole tree
    pub fn drop_tree(&mut self, tree: &str) {
        self.trees.remove(tree);
        self.dropped_trees.insert(tree.to_string());
        self.ops.push(WalOp::DropTree {
            tree: tree.to_string(),
        });
    }

    /// Publish a segment blob under `name`, replacing any previous one.
    pub fn put_segment(&mut self, name: &str, bytes: Vec<u8>) {
        let file = if self.env.segments_dir().is_some() {
            segment_file_name(name, self.tx_id)
        } else {
            String::new()
        };
        self.segments.insert(
            name.to_string(),
            Some(SegmentWrite {
                file: file.clone(),
                backing: Arc::new(RegionBacking::Owned(bytes.into_boxed_slice())),
            }),
        );
        self.ops.push(WalOp::PutSegment {
            name: name.to_string(),
            file,
        });
    }

    /// Remove a published segment
    pub fn delete_segment(&mut self, name: &str) {
        self.segments.insert(name.to_string(), None);
        self.ops.push(WalOp::DeleteSegment {
            name: name.to_string(),
        });
    }

    /// True if a segment named `name` exists, including this transaction's writes
    pub fn has_segment(&self, name: &str) -> bool {
        match self.segments.get(name) {
            Some(pending) => pending.is_some(),
            None => self.base().segments.contains_key(name),
        }
    }

    /// Make every buffered operation durable and visible.
    ///
    /// Order: segment files are written (temp + rename) and mapped, the write
    /// set is appended to the journal, then the new state is published. A
    /// failure before the journal append leaves no trace.
    pub fn commit(mut self) -> Result<()> {
        if self.ops.is_empty() {
            self.committed = true;
            return Ok(());
        }

        let backings = self.persist_segments()?;

        let published: BTreeMap<String, Arc<RegionBacking>> = backings
            .iter()
            .map(|(name, (_, backing))| (name.clone(), Arc::clone(backing)))
            .collect();
        // Nothing reaches the journal that could not be applied on replay.
        if let Err(e) = EnvState::validate(&self.ops, &published) {
            self.discard_segment_files(&backings);
            return Err(e);
        }

        let record = JournalRecord {
            tx_id: self.tx_id,
            ops: std::mem::take(&mut self.ops),
        };
        if let Some(journal) = self.writer.journal.as_mut() {
            if let Err(e) = journal.append(&record) {
                self.discard_segment_files(&backings);
                return Err(e);
            }
        }

        let replaced = self.replaced_segment_files();
        // Release our pin on the base so the publish below can reuse it in place.
        drop(std::mem::take(&mut self.base));
        {
            let mut guard = self.env.state.write();
            let current = std::mem::take(&mut *guard);
            let mut next = Arc::try_unwrap(current).unwrap_or_else(|shared| (*shared).clone());
            match next.apply(record.tx_id, &record.ops, &published) {
                Ok(()) => *guard = Arc::new(next),
                Err(e) => {
                    // `apply` validates before mutating: `next` is still the committed state.
                    *guard = Arc::new(next);
                    return Err(e);
                }
            }
        }
        self.committed = true;

        debug!(
            target: "quarry::storage",
            tx_id = record.tx_id,
            ops = record.ops.len(),
            "Committed"
        );

        if let Some(dir) = self.env.segments_dir() {
            for file in replaced {
                if let Err(e) = fs::remove_file(dir.join(&file)) {
                    debug!(target: "quarry::storage", file = %file, error = %e, "Obsolete segment not removed");
                }
            }
        }
        Ok(())
    }

    /// Discard every buffered operation and release the writer lock.
    pub fn rollback(self) {
        drop(self);
    }

    /// Write pending segment blobs to disk (when persistent) and return the
    /// backing each published name resolves to.
    fn persist_segments(&self) -> Result<BTreeMap<String, (String, Arc<RegionBacking>)>> {
        let mut backings = BTreeMap::new();
        let dir = self.env.segments_dir();
        for (name, pending) in &self.segments {
            let Some(write) = pending else { continue };
            let backing = match dir {
                Some(dir) => match write_segment_file(dir, &write.file, write.backing.as_bytes()) {
                    Ok(backing) => backing,
                    Err(e) => {
                        self.discard_segment_files(&backings);
                        return Err(e);
                    }
                },
                None => Arc::clone(&write.backing),
            };
            backings.insert(name.clone(), (write.file.clone(), backing));
        }
        Ok(backings)
    }

    fn discard_segment_files(&self, backings: &BTreeMap<String, (String, Arc<RegionBacking>)>) {
        if let Some(dir) = self.env.segments_dir() {
            for (file, _) in backings.values() {
                if !file.is_empty() {
                    let _ = fs::remove_file(dir.join(file));
                }
            }
        }
    }

    /// Files of base segments that this transaction replaces or deletes
    fn replaced_segment_files(&self) -> Vec<String> {
        self.segments
            .keys()
            .filter_map(|name| self.base().segments.get(name))
            .map(|entry| entry.file.clone())
            .filter(|file| !file.is_empty())
            .collect()
    }
}

impl TreeReader for WriteTransaction<'_> {
    fn tree_get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.trees.get(tree).and_then(|t| t.get(key)) {
            return Ok(pending.clone());
        }
        if self.dropped_trees.contains(tree) {
            return Ok(None);
        }
        Ok(self.base().trees.get(tree).and_then(|t| t.get(key)).cloned())
    }

    fn tree_entries(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = if self.dropped_trees.contains(tree) {
            BTreeMap::new()
        } else {
            self.base()
                .trees
                .get(tree)
                .map(|t| (**t).clone())
                .unwrap_or_default()
        };
        if let Some(pending) = self.trees.get(tree) {
            for (key, value) in pending {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.scope.close();
        if !self.committed && !self.ops.is_empty() {
            debug!(
                target: "quarry::storage",
                tx_id = self.tx_id,
                ops = self.ops.len(),
                "Write transaction rolled back"
            );
        }
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("tx_id", &self.tx_id)
            .field("pending", &self.ops.len())
            .finish()
    }
}

/// File name for a segment written by `tx_id`
pub(crate) fn segment_file_name(name: &str, tx_id: u64) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}-{:016x}.seg", sanitized, tx_id)
}

/// Write `bytes` to `dir/file` atomically and map the result.
fn write_segment_file(dir: &Path, file: &str, bytes: &[u8]) -> Result<Arc<RegionBacking>> {
    let final_path = dir.join(file);
    let tmp_path: PathBuf = dir.join(format!("{}.tmp", file));
    let result = (|| -> Result<()> {
        let mut out = File::create(&tmp_path)?;
        out.write_all(bytes)?;
        out.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!(target: "quarry::storage", file = %file, error = %e, "Segment write failed");
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if bytes.is_empty() {
        // Zero-length files cannot be mapped.
        Ok(Arc::new(RegionBacking::Owned(Box::default())))
    } else {
        Ok(Arc::new(RegionBacking::map_file(&final_path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static_assertions::assert_impl_all!(ReadTransaction: Send, Sync);

    fn collect_etags(iter: RecordIter<Document>) -> Vec<Etag> {
        iter.map(|r| r.unwrap().etag).collect()
    }

    fn seeded() -> Environment {
        let env = Environment::in_memory();
        let mut tx = env.write_transaction();
        for i in 1..=5 {
            tx.put_document(&format!("users/{}", i), "Users", json!({ "n": i }))
                .unwrap();
            tx.put_document(&format!("orders/{}", i), "Orders", json!({ "n": i }))
                .unwrap();
        }
        tx.commit().unwrap();
        env
    }

    #[test]
    fn test_documents_from_collection() {
        let env = seeded();
        let tx = env.read_transaction();
        let users = Collection::named("Users");
        let etags = collect_etags(tx.documents_from(&users, 0, 0, usize::MAX).unwrap());
        assert_eq!(etags, vec![1, 3, 5, 7, 9]);
        let etags = collect_etags(tx.documents_from(&users, 4, 1, 2).unwrap());
        assert_eq!(etags, vec![7, 9]);
    }

    #[test]
    fn test_documents_from_all() {
        let env = seeded();
        let tx = env.read_transaction();
        let etags = collect_etags(tx.documents_from(&Collection::All, 9, 0, 10).unwrap());
        assert_eq!(etags, vec![9, 10]);
        assert_eq!(tx.last_document_etag(&Collection::All).unwrap(), 10);
        assert_eq!(tx.last_document_etag(&Collection::named("Users")).unwrap(), 9);
        assert_eq!(tx.last_document_etag(&Collection::named("Nope")).unwrap(), 0);
    }

    #[test]
    fn test_cursor_after_drop_is_stale_once() {
        let env = seeded();
        let tx = env.read_transaction();
        let mut iter = tx.documents_from(&Collection::All, 0, 0, 100).unwrap();
        assert!(iter.next().unwrap().is_ok());
        drop(tx);
        assert!(matches!(iter.next(), Some(Err(Error::StaleContext))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_write_sees_own_writes_readers_do_not() {
        let env = seeded();
        let reader = env.read_transaction();
        let mut tx = env.write_transaction();
        tx.put_document("users/9", "Users", json!({})).unwrap();
        assert!(tx.document("USERS/9").is_some());
        assert!(reader.document("users/9").is_none());
        tx.commit().unwrap();
        assert!(reader.document("users/9").is_none());
        assert!(env.read_transaction().document("users/9").is_some());
    }

    #[test]
    fn test_collection_change_rejected() {
        let env = seeded();
        let mut tx = env.write_transaction();
        let err = tx.put_document("users/1", "Orders", json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(tx.put_document("Users/1", "users", json!({})).is_ok());
    }

    #[test]
    fn test_reserved_collection_rejected() {
        let env = Environment::in_memory();
        let mut tx = env.write_transaction();
        assert!(matches!(
            tx.put_document("a", "@all_docs", json!({})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            tx.put_document("", "A", json!({})),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_delete_creates_tombstone() {
        let env = seeded();
        let mut tx = env.write_transaction();
        let etag = tx.delete_document("users/2").unwrap().unwrap();
        assert_eq!(tx.delete_document("users/2").unwrap(), None);
        tx.commit().unwrap();

        let reader = env.read_transaction();
        assert!(reader.document("users/2").is_none());
        let tombstone = reader.tombstone("users/2").unwrap();
        assert_eq!(tombstone.etag, etag);
        assert_eq!(tombstone.deleted_etag, 3);
        assert_eq!(
            reader
                .last_tombstone_etag(&Collection::named("users"))
                .unwrap(),
            etag
        );
    }

    #[test]
    fn test_rollback_discards() {
        let env = seeded();
        {
            let mut tx = env.write_transaction();
            tx.put_document("users/100", "Users", json!({})).unwrap();
            tx.tree_put("t", b"k", b"v".to_vec());
            tx.rollback();
        }
        let reader = env.read_transaction();
        assert!(reader.document("users/100").is_none());
        assert_eq!(reader.tree_get("t", b"k").unwrap(), None);
        assert_eq!(reader.last_etag(), 10);
    }

    #[test]
    fn test_tree_overlay() {
        let env = Environment::in_memory();
        let mut tx = env.write_transaction();
        tx.tree_put("t", b"a", b"1".to_vec());
        tx.tree_put("t", b"b", b"2".to_vec());
        tx.commit().unwrap();

        let mut tx = env.write_transaction();
        tx.tree_delete("t", b"a");
        tx.tree_put("t", b"c", b"3".to_vec());
        assert_eq!(tx.tree_get("t", b"a").unwrap(), None);
        let keys: Vec<Vec<u8>> = tx.tree_entries("t").unwrap().into_iter().map(|e| e.0).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        tx.drop_tree("t");
        assert!(tx.tree_entries("t").unwrap().is_empty());
        tx.tree_put("t", b"z", b"9".to_vec());
        tx.commit().unwrap();

        let reader = env.read_transaction();
        assert_eq!(reader.tree_entries("t").unwrap().len(), 1);
        assert_eq!(reader.tree_get("t", b"z").unwrap(), Some(b"9".to_vec()));
    }

    #[test]
    fn test_segment_region_bound_to_transaction() {
        let env = Environment::in_memory();
        let mut tx = env.write_transaction();
        tx.put_segment("idx", b"hello".to_vec());
        assert!(tx.has_segment("idx"));
        tx.commit().unwrap();

        let reader = env.read_transaction();
        let region = reader.segment("idx").unwrap().unwrap();
        assert_eq!(region.byte_at(0).unwrap(), b'h');
        assert!(reader.segment("missing").unwrap().is_none());
        drop(reader);
        assert!(matches!(region.byte_at(0), Err(Error::AlreadyDisposed)));
    }

    #[test]
    fn test_segment_file_name_sanitized() {
        assert_eq!(
            segment_file_name("index/Users By Name", 3),
            "index_Users_By_Name-0000000000000003.seg"
        );
    }
}
