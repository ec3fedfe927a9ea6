//! Committed environment state and the write-set operations applied to it
//!
//! `EnvState` is immutable once published. Commit and journal replay build the
//! next state with `Arc::make_mut`, so a table is only copied when a reader
//! still holds the previous snapshot.
//!
//! # Secondary Indices
//!
//! - `by_id`: lower-cased id → record, one live version per id
//! - `by_etag`: etag → record, the "all documents" ordering
//! - `by_collection`: collection key → (etag → record)
//!
//! All three are updated together; a record is never visible in one and
//! missing from another.

use crate::mapped::RegionBacking;
use quarry_core::{Document, Error, Etag, Result, Tombstone, ALL_DOCUMENTS_COLLECTION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered key/value tree
pub(crate) type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// Record stored in an etag-ordered table
pub(crate) trait EtagRecord {
    fn lower_id(&self) -> &str;
    fn etag(&self) -> Etag;
    fn collection_key(&self) -> String;
}

impl EtagRecord for Document {
    fn lower_id(&self) -> &str {
        &self.lower_id
    }
    fn etag(&self) -> Etag {
        self.etag
    }
    fn collection_key(&self) -> String {
        Document::collection_key(self)
    }
}

impl EtagRecord for Tombstone {
    fn lower_id(&self) -> &str {
        &self.lower_id
    }
    fn etag(&self) -> Etag {
        self.etag
    }
    fn collection_key(&self) -> String {
        Tombstone::collection_key(self)
    }
}

/// Records indexed by id, by etag, and by collection then etag.
#[derive(Debug)]
pub(crate) struct EtagTable<T> {
    by_id: BTreeMap<String, Arc<T>>,
    by_etag: BTreeMap<Etag, Arc<T>>,
    by_collection: BTreeMap<String, BTreeMap<Etag, Arc<T>>>,
}

// Manual impls: derive would require `T: Clone`, the table only clones `Arc`s.
impl<T> Clone for EtagTable<T> {
    fn clone(&self) -> Self {
        Self {
            by_id: self.by_id.clone(),
            by_etag: self.by_etag.clone(),
            by_collection: self.by_collection.clone(),
        }
    }
}

impl<T> Default for EtagTable<T> {
    fn default() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_etag: BTreeMap::new(),
            by_collection: BTreeMap::new(),
        }
    }
}

impl<T: EtagRecord> EtagTable<T> {
    /// Insert a record, replacing any previous version with the same id
    pub(crate) fn insert(&mut self, record: Arc<T>) {
        self.remove(record.lower_id());
        let collection = record.collection_key();
        self.by_etag.insert(record.etag(), Arc::clone(&record));
        self.by_collection
            .entry(collection)
            .or_default()
            .insert(record.etag(), Arc::clone(&record));
        self.by_id.insert(record.lower_id().to_string(), record);
    }

    /// Remove the record with this id from every index
    pub(crate) fn remove(&mut self, lower_id: &str) -> Option<Arc<T>> {
        let old = self.by_id.remove(lower_id)?;
        self.by_etag.remove(&old.etag());
        let collection = old.collection_key();
        if let Some(entries) = self.by_collection.get_mut(&collection) {
            entries.remove(&old.etag());
            if entries.is_empty() {
                self.by_collection.remove(&collection);
            }
        }
        Some(old)
    }

    pub(crate) fn get(&self, lower_id: &str) -> Option<&Arc<T>> {
        self.by_id.get(lower_id)
    }

    /// Etag-ordered map for a collection key (`@all_docs` for everything)
    pub(crate) fn ordered(&self, collection_key: &str) -> Option<&BTreeMap<Etag, Arc<T>>> {
        if collection_key == ALL_DOCUMENTS_COLLECTION {
            Some(&self.by_etag)
        } else {
            self.by_collection.get(collection_key)
        }
    }

    /// Highest etag in the collection, 0 when empty
    pub(crate) fn last_etag(&self, collection_key: &str) -> Etag {
        self.ordered(collection_key)
            .and_then(|entries| entries.keys().next_back().copied())
            .unwrap_or(0)
    }

    pub(crate) fn count(&self, collection_key: &str) -> usize {
        self.ordered(collection_key).map_or(0, BTreeMap::len)
    }

    pub(crate) fn collections(&self) -> impl Iterator<Item = &String> {
        self.by_collection.keys()
    }
}

/// One operation of a committed write set.
///
/// The list of operations of a transaction is what the journal records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WalOp {
    PutDocument(Document),
    DeleteDocument(Tombstone),
    PutTree {
        tree: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    DeleteTree {
        tree: String,
        key: Vec<u8>,
    },
    DropTree {
        tree: String,
    },
    /// `file` is the segment file name under `segments/`, empty in memory
    PutSegment {
        name: String,
        file: String,
    },
    DeleteSegment {
        name: String,
    },
}

/// Committed state of an environment.
#[derive(Debug, Clone, Default)]
pub(crate) struct EnvState {
    pub(crate) documents: Arc<EtagTable<Document>>,
    pub(crate) tombstones: Arc<EtagTable<Tombstone>>,
    pub(crate) trees: BTreeMap<String, Arc<Tree>>,
    pub(crate) segments: BTreeMap<String, SegmentEntry>,
    pub(crate) last_etag: Etag,
    pub(crate) last_tx_id: u64,
}

/// Published segment blob
#[derive(Debug, Clone)]
pub(crate) struct SegmentEntry {
    pub(crate) file: String,
    pub(crate) backing: Arc<RegionBacking>,
}

impl EnvState {
    /// Check that `ops` can be applied: every `PutSegment` has a backing.
    pub(crate) fn validate(
        ops: &[WalOp],
        segments: &BTreeMap<String, Arc<RegionBacking>>,
    ) -> Result<()> {
        for op in ops {
            if let WalOp::PutSegment { name, .. } = op {
                if !segments.contains_key(name) {
                    return Err(Error::corruption(format!(
                        "segment '{}' has no backing data",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply one committed write set.
    ///
    /// `segments` resolves the backing of every `PutSegment` in `ops`. The
    /// write set is validated first; on error the state is unchanged.
    pub(crate) fn apply(
        &mut self,
        tx_id: u64,
        ops: &[WalOp],
        segments: &BTreeMap<String, Arc<RegionBacking>>,
    ) -> Result<()> {
        Self::validate(ops, segments)?;
        for op in ops {
            match op {
                WalOp::PutDocument(doc) => {
                    // A tombstone left in another collection stays for that collection's indexes.
                    let same_collection = self
                        .tombstones
                        .get(&doc.lower_id)
                        .is_some_and(|t| t.collection_key() == doc.collection_key());
                    if same_collection {
                        Arc::make_mut(&mut self.tombstones).remove(&doc.lower_id);
                    }
                    self.last_etag = self.last_etag.max(doc.etag);
                    Arc::make_mut(&mut self.documents).insert(Arc::new(doc.clone()));
                }
                WalOp::DeleteDocument(tombstone) => {
                    Arc::make_mut(&mut self.documents).remove(&tombstone.lower_id);
                    self.last_etag = self.last_etag.max(tombstone.etag);
                    Arc::make_mut(&mut self.tombstones).insert(Arc::new(tombstone.clone()));
                }
                WalOp::PutTree { tree, key, value } => {
                    let tree = self.trees.entry(tree.clone()).or_default();
                    Arc::make_mut(tree).insert(key.clone(), value.clone());
                }
                WalOp::DeleteTree { tree, key } => {
                    if let Some(tree) = self.trees.get_mut(tree) {
                        Arc::make_mut(tree).remove(key);
                    }
                }
                WalOp::DropTree { tree } => {
                    self.trees.remove(tree);
                }
                WalOp::PutSegment { name, file } => {
                    let backing = segments.get(name).ok_or_else(|| {
                        Error::corruption(format!("segment '{}' has no backing data", name))
                    })?;
                    self.segments.insert(
                        name.clone(),
                        SegmentEntry {
                            file: file.clone(),
                            backing: Arc::clone(backing),
                        },
                    );
                }
                WalOp::DeleteSegment { name } => {
                    self.segments.remove(name);
                }
            }
        }
        self.last_tx_id = self.last_tx_id.max(tx_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(id: &str, collection: &str, etag: Etag) -> Document {
        Document {
            id: id.to_string(),
            lower_id: id.to_lowercase(),
            collection: collection.to_string(),
            etag,
            last_modified: Utc::now(),
            size: 2,
            data: serde_json::json!({}),
        }
    }

    fn tombstone(id: &str, collection: &str, etag: Etag, deleted_etag: Etag) -> Tombstone {
        Tombstone {
            id: id.to_string(),
            lower_id: id.to_lowercase(),
            collection: collection.to_string(),
            etag,
            deleted_etag,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_insert_replaces_previous_version() {
        let mut table = EtagTable::default();
        table.insert(Arc::new(doc("users/1", "Users", 1)));
        table.insert(Arc::new(doc("users/2", "Users", 2)));
        table.insert(Arc::new(doc("Users/1", "Users", 3)));

        let etags: Vec<Etag> = table.ordered("users").unwrap().keys().copied().collect();
        assert_eq!(etags, vec![2, 3]);
        assert_eq!(table.count(ALL_DOCUMENTS_COLLECTION), 2);
        assert_eq!(table.last_etag("users"), 3);
    }

    #[test]
    fn test_remove_drops_empty_collection() {
        let mut table = EtagTable::default();
        table.insert(Arc::new(doc("orders/1", "Orders", 7)));
        assert!(table.remove("orders/1").is_some());
        assert!(table.ordered("orders").is_none());
        assert_eq!(table.last_etag("orders"), 0);
        assert!(table.remove("orders/1").is_none());
    }

    #[test]
    fn test_apply_put_then_delete() {
        let mut state = EnvState::default();
        state
            .apply(
                1,
                &[
                    WalOp::PutDocument(doc("users/1", "Users", 1)),
                    WalOp::DeleteDocument(tombstone("users/1", "Users", 2, 1)),
                ],
                &BTreeMap::new(),
            )
            .unwrap();

        assert!(state.documents.get("users/1").is_none());
        assert_eq!(state.tombstones.last_etag("users"), 2);
        assert_eq!(state.last_etag, 2);
        assert_eq!(state.last_tx_id, 1);
    }

    #[test]
    fn test_apply_put_removes_tombstone() {
        let mut state = EnvState::default();
        state
            .apply(
                1,
                &[
                    WalOp::PutDocument(doc("users/1", "Users", 1)),
                    WalOp::DeleteDocument(tombstone("users/1", "Users", 2, 1)),
                    WalOp::PutDocument(doc("users/1", "Users", 3)),
                ],
                &BTreeMap::new(),
            )
            .unwrap();
        assert!(state.tombstones.get("users/1").is_none());
        assert_eq!(state.documents.get("users/1").unwrap().etag, 3);
    }

    #[test]
    fn test_apply_put_in_other_collection_keeps_tombstone() {
        let mut state = EnvState::default();
        state
            .apply(
                1,
                &[
                    WalOp::PutDocument(doc("a", "Users", 1)),
                    WalOp::DeleteDocument(tombstone("a", "Users", 2, 1)),
                    WalOp::PutDocument(doc("a", "Orders", 3)),
                ],
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(state.tombstones.get("a").unwrap().collection, "Users");
        assert_eq!(state.tombstones.last_etag("users"), 2);
        assert_eq!(state.documents.last_etag("orders"), 3);
    }

    #[test]
    fn test_apply_segment_without_backing_is_corruption() {
        let mut state = EnvState::default();
        let err = state
            .apply(
                1,
                &[WalOp::PutSegment {
                    name: "seg".to_string(),
                    file: String::new(),
                }],
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_failed_apply_leaves_state_unchanged() {
        let mut state = EnvState::default();
        state
            .apply(1, &[WalOp::PutDocument(doc("a", "Docs", 1))], &BTreeMap::new())
            .unwrap();

        let err = state
            .apply(
                2,
                &[
                    WalOp::PutDocument(doc("b", "Docs", 2)),
                    WalOp::DeleteDocument(tombstone("a", "Docs", 3, 1)),
                    WalOp::PutSegment {
                        name: "seg".to_string(),
                        file: String::new(),
                    },
                ],
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert!(state.documents.get("a").is_some());
        assert!(state.documents.get("b").is_none());
        assert!(state.tombstones.get("a").is_none());
        assert_eq!(state.last_etag, 1);
        assert_eq!(state.last_tx_id, 1);
    }

    #[test]
    fn test_apply_does_not_disturb_shared_snapshot() {
        let mut state = EnvState::default();
        state
            .apply(1, &[WalOp::PutDocument(doc("a", "C", 1))], &BTreeMap::new())
            .unwrap();
        let snapshot = state.clone();
        state
            .apply(2, &[WalOp::PutDocument(doc("b", "C", 2))], &BTreeMap::new())
            .unwrap();
        assert_eq!(snapshot.documents.count(ALL_DOCUMENTS_COLLECTION), 1);
        assert_eq!(state.documents.count(ALL_DOCUMENTS_COLLECTION), 2);
    }
}
