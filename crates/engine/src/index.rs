//! Index definitions, live indexes and the index registry

use crate::input::MappedInput;
use crate::metadata::{self, Fields, IndexEntry, IndexingError};
use crate::segment::{SegmentReader, SegmentWriter};
use crate::staleness;
use crate::worker::CancellationFlag;
use dashmap::DashMap;
use quarry_core::{lower_id, Collection, Document, Error, Result};
use quarry_storage::{Environment, ReadTransaction, TreeReader};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Per-document map logic.
///
/// `Ok(None)` means the document produces no entry (and any previous entry
/// is removed). An `Err` is handled by the worker's error policy.
pub trait MapFunction: Send + Sync {
    /// Map one document
    fn map(&self, document: &Document) -> Result<Option<Fields>>;
}

impl<F> MapFunction for F
where
    F: Fn(&Document) -> Result<Option<Fields>> + Send + Sync,
{
    fn map(&self, document: &Document) -> Result<Option<Fields>> {
        self(document)
    }
}

/// Name, source collections and map logic of an index.
#[derive(Clone)]
pub struct IndexDefinition {
    name: String,
    collections: Vec<Collection>,
    map: Arc<dyn MapFunction>,
}

impl IndexDefinition {
    /// Build a definition.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty name or an empty collection list.
    pub fn new(
        name: impl Into<String>,
        collections: Vec<Collection>,
        map: impl MapFunction + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_input("index name must not be empty"));
        }
        if collections.is_empty() {
            return Err(Error::invalid_input(format!(
                "index '{}' must cover at least one collection",
                name
            )));
        }
        let mut unique: Vec<Collection> = Vec::with_capacity(collections.len());
        for collection in collections {
            if !unique.contains(&collection) {
                unique.push(collection);
            }
        }
        Ok(Self {
            name,
            collections: unique,
            map: Arc::new(map),
        })
    }

    /// Build a definition from a closure
    pub fn from_fn<F>(name: impl Into<String>, collections: Vec<Collection>, map: F) -> Result<Self>
    where
        F: Fn(&Document) -> Result<Option<Fields>> + Send + Sync + 'static,
    {
        Self::new(name, collections, map)
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source collections, deduplicated
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("collections", &self.collections)
            .finish()
    }
}

/// Summary of a flushed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Entries written
    pub entries: u32,
    /// Segment size in bytes
    pub bytes: usize,
}

/// A registered index.
///
/// Its persisted state (watermarks, entries, errors, segment) lives in the
/// storage environment; this value carries the definition and the
/// cancellation flag of running cycles.
#[derive(Debug)]
pub struct Index {
    definition: IndexDefinition,
    cancellation: CancellationFlag,
}

impl Index {
    /// Wrap a definition
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            cancellation: CancellationFlag::new(),
        }
    }

    /// Index name
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Source collections
    pub fn collections(&self) -> &[Collection] {
        self.definition.collections()
    }

    /// Definition
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    /// Stop signal observed by the worker
    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Run the map logic on one document
    pub fn map_document(&self, document: &Document) -> Result<Option<Fields>> {
        self.definition.map.map(document)
    }

    /// True if committed documents or deletes are not yet reflected
    pub fn is_stale(&self, tx: &ReadTransaction) -> Result<bool> {
        staleness::is_stale(tx, self)
    }

    /// Stored entry for a document id
    pub fn entry<R: TreeReader + ?Sized>(&self, reader: &R, id: &str) -> Result<Option<IndexEntry>> {
        metadata::read_entry(reader, self.name(), &lower_id(id))
    }

    /// All stored entries, keyed by lower-cased document id
    pub fn entries<R: TreeReader + ?Sized>(&self, reader: &R) -> Result<Vec<(String, IndexEntry)>> {
        metadata::read_entries(reader, self.name())
    }

    /// Recorded map failures, oldest first
    pub fn errors<R: TreeReader + ?Sized>(&self, reader: &R) -> Result<Vec<IndexingError>> {
        metadata::read_errors(reader, self.name())
    }

    /// Name of the segment blob in storage
    pub fn segment_name(&self) -> String {
        format!("index/{}/segment", self.name())
    }

    /// Freeze the current entries into a segment blob, replacing the previous one.
    pub fn flush_segment(&self, env: &Environment) -> Result<SegmentSummary> {
        let mut tx = env.write_transaction();
        let entries = self.entries(&tx)?;
        let mut writer = SegmentWriter::new();
        for (key, entry) in &entries {
            writer.add(key, entry)?;
        }
        let count = writer.count();
        let bytes = writer.finish();
        let size = bytes.len();

        tx.put_segment(&self.segment_name(), bytes);
        self.cancellation.check()?;
        tx.commit()?;

        info!(
            target: "quarry::indexing",
            index = self.name(),
            entries = count,
            bytes = size,
            "Flushed index segment"
        );
        Ok(SegmentSummary {
            entries: count,
            bytes: size,
        })
    }

    /// Open the flushed segment, valid while `tx` is open.
    pub fn open_segment(&self, tx: &ReadTransaction) -> Result<Option<SegmentReader<MappedInput>>> {
        match tx.segment(&self.segment_name())? {
            Some(region) => Ok(Some(SegmentReader::open(MappedInput::open(region)?)?)),
            None => Ok(None),
        }
    }
}

/// Registry of live indexes, safe for concurrent use.
#[derive(Debug, Default)]
pub struct IndexStore {
    indexes: DashMap<String, Arc<Index>>,
}

impl IndexStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index.
    ///
    /// Persisted state under the same name is picked up, so re-registering
    /// after a restart resumes from the stored watermarks.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the name is already registered.
    pub fn register(&self, definition: IndexDefinition) -> Result<Arc<Index>> {
        use dashmap::mapref::entry::Entry;
        match self.indexes.entry(definition.name().to_string()) {
            Entry::Occupied(_) => Err(Error::invalid_operation(format!(
                "index '{}' already exists",
                definition.name()
            ))),
            Entry::Vacant(slot) => {
                let index = Arc::new(Index::new(definition));
                slot.insert(Arc::clone(&index));
                info!(target: "quarry::indexing", index = index.name(), "Registered index");
                Ok(index)
            }
        }
    }

    /// Look up an index by name
    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// All registered indexes, sorted by name
    pub fn all(&self) -> Vec<Arc<Index>> {
        let mut all: Vec<Arc<Index>> = self.indexes.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of registered indexes
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// True when no index is registered
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Unregister an index, cancel its running cycle and delete its state.
    ///
    /// Returns false if no such index was registered.
    pub fn remove(&self, env: &Environment, name: &str) -> Result<bool> {
        let Some((_, index)) = self.indexes.remove(name) else {
            return Ok(false);
        };
        index.cancellation().cancel();

        let mut tx = env.write_transaction();
        metadata::drop_index_state(&mut tx, name);
        let segment = index.segment_name();
        if tx.has_segment(&segment) {
            tx.delete_segment(&segment);
        }
        tx.commit()?;
        info!(target: "quarry::indexing", index = name, "Removed index");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::MapWorker;
    use serde_json::json;

    static_assertions::assert_impl_all!(IndexStore: Send, Sync);
    static_assertions::assert_impl_all!(Index: Send, Sync);

    fn definition(name: &str) -> IndexDefinition {
        IndexDefinition::from_fn(name, vec![Collection::named("Users")], |doc: &Document| {
            Ok(Some(Fields::from([(
                "name".to_string(),
                doc.data["name"].clone(),
            )])))
        })
        .unwrap()
    }

    fn seeded() -> Environment {
        let env = Environment::in_memory();
        let mut tx = env.write_transaction();
        for (i, name) in ["ann", "bob", "cid"].iter().enumerate() {
            tx.put_document(&format!("users/{}", i), "Users", json!({ "name": name }))
                .unwrap();
        }
        tx.commit().unwrap();
        env
    }

    #[test]
    fn test_definition_validation() {
        assert!(IndexDefinition::from_fn("", vec![Collection::All], |_: &Document| Ok(None)).is_err());
        assert!(IndexDefinition::from_fn("x", vec![], |_: &Document| Ok(None)).is_err());
        let def = IndexDefinition::from_fn(
            "x",
            vec![Collection::named("A"), Collection::named("a")],
            |_: &Document| Ok(None),
        )
        .unwrap();
        assert_eq!(def.collections().len(), 1);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let store = IndexStore::new();
        store.register(definition("Users/ByName")).unwrap();
        assert!(matches!(
            store.register(definition("Users/ByName")),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(store.names(), vec!["Users/ByName".to_string()]);
        assert!(store.get("Users/ByName").is_some());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_flush_and_open_segment() {
        let env = seeded();
        let store = IndexStore::new();
        let index = store.register(definition("Users/ByName")).unwrap();
        MapWorker::default().run_all(&env, &index).unwrap();

        let summary = index.flush_segment(&env).unwrap();
        assert_eq!(summary.entries, 3);

        let tx = env.read_transaction();
        let reader = index.open_segment(&tx).unwrap().unwrap();
        let found = reader.find("users/1").unwrap().unwrap();
        assert_eq!(found.entry.fields["name"], json!("bob"));
        let keys: Vec<String> = reader.map(|r| r.unwrap().key).collect();
        assert_eq!(keys, vec!["users/0", "users/1", "users/2"]);
    }

    #[test]
    fn test_segment_reader_invalid_after_transaction() {
        let env = seeded();
        let index = Index::new(definition("Users/ByName"));
        MapWorker::default().run_all(&env, &index).unwrap();
        index.flush_segment(&env).unwrap();

        let tx = env.read_transaction();
        let mut reader = index.open_segment(&tx).unwrap().unwrap();
        drop(tx);
        assert!(matches!(reader.next(), Some(Err(Error::AlreadyDisposed))));
    }

    #[test]
    fn test_remove_cancels_and_drops_state() {
        let env = seeded();
        let store = IndexStore::new();
        let index = store.register(definition("Users/ByName")).unwrap();
        MapWorker::default().run_all(&env, &index).unwrap();
        index.flush_segment(&env).unwrap();

        assert!(store.remove(&env, "Users/ByName").unwrap());
        assert!(!store.remove(&env, "Users/ByName").unwrap());
        assert!(index.cancellation().is_cancelled());
        assert!(store.is_empty());

        let tx = env.read_transaction();
        assert!(index.entries(&tx).unwrap().is_empty());
        assert!(index.open_segment(&tx).unwrap().is_none());
    }
}
