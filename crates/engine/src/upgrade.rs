//! Schema upgrade coordinator
//!
//! The persisted schema version lives in the `configuration` tree. Upgrading
//! from N to a target T runs the registered steps N→N+1, N+1→N+2, … one at a
//! time. Each step gets an [`UpdateStep`]: a read transaction on the
//! pre-migration snapshot, the write transaction that will carry the step's
//! changes, and storage facades over both.
//!
//! # Transaction Order
//!
//! The write transaction is opened first. It holds the environment's writer
//! lock, so no other writer can commit between it and the read transaction
//! opened next; both see the same base state.
//!
//! A failing step drops its write transaction: nothing of the step is
//! committed and the stored version stays at N.

use quarry_core::{
    Collection, Document, DocumentSource, Error, Etag, RecordIter, Result, ALL_DOCUMENTS_COLLECTION,
};
use quarry_storage::{Environment, ReadTransaction, TreeReader, WriteTransaction};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Tree holding database-wide settings
pub const CONFIGURATION_TREE: &str = "configuration";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Stored schema version, 0 for a fresh store.
pub fn schema_version<R: TreeReader + ?Sized>(reader: &R) -> Result<u32> {
    match reader.tree_get(CONFIGURATION_TREE, SCHEMA_VERSION_KEY)? {
        None => Ok(0),
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::corruption("schema version must be 4 bytes"))?;
            Ok(u32::from_le_bytes(raw))
        }
    }
}

/// Settings stored in the `configuration` tree, seen through the step's write
/// transaction.
pub struct ConfigurationStorage<'s, 'env> {
    tx: &'s mut WriteTransaction<'env>,
}

impl ConfigurationStorage<'_, '_> {
    /// Value for `key`, including this step's writes
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.tx.tree_get(CONFIGURATION_TREE, key.as_bytes())
    }

    /// UTF-8 value for `key`
    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get(key)?
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| Error::corruption(format!("configuration '{}' is not UTF-8", key)))
            })
            .transpose()
    }

    /// Set `key`
    pub fn put(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.tx
            .tree_put(CONFIGURATION_TREE, key.as_bytes(), value.into());
    }

    /// Remove `key`
    pub fn delete(&mut self, key: &str) {
        self.tx.tree_delete(CONFIGURATION_TREE, key.as_bytes());
    }

    /// Schema version the step is upgrading from
    pub fn schema_version(&self) -> Result<u32> {
        schema_version(&*self.tx)
    }
}

/// Documents as seen by an upgrade step.
///
/// Reads of single documents include the step's own writes; scans run over the
/// pre-migration snapshot, so a step can rewrite every document it iterates
/// without seeing its own output.
pub struct DocumentsStorage<'s, 'env> {
    read: &'s ReadTransaction,
    tx: &'s mut WriteTransaction<'env>,
}

impl DocumentsStorage<'_, '_> {
    /// Current version of a document
    pub fn get(&self, id: &str) -> Option<Arc<Document>> {
        self.tx.document(id)
    }

    /// Write a document
    pub fn put(&mut self, id: &str, collection: &str, data: serde_json::Value) -> Result<Etag> {
        self.tx.put_document(id, collection, data)
    }

    /// Delete a document
    pub fn delete(&mut self, id: &str) -> Result<Option<Etag>> {
        self.tx.delete_document(id)
    }

    /// Every document of the collection in the pre-migration snapshot
    pub fn scan(&self, collection: &Collection) -> Result<RecordIter<Document>> {
        self.read.documents_from(collection, 0, 0, usize::MAX)
    }

    /// Document count per collection key in the pre-migration snapshot
    pub fn collection_counts(&self) -> BTreeMap<String, usize> {
        self.read
            .collections()
            .into_iter()
            .map(|key| {
                let count = self.read.count_documents(&Collection::named(key.clone()));
                (key, count)
            })
            .chain(std::iter::once((
                ALL_DOCUMENTS_COLLECTION.to_string(),
                self.read.count_documents(&Collection::All),
            )))
            .collect()
    }
}

/// Context of one N→N+1 transition.
pub struct UpdateStep<'s, 'env> {
    from: u32,
    read: &'s ReadTransaction,
    tx: &'s mut WriteTransaction<'env>,
}

impl<'s, 'env> UpdateStep<'s, 'env> {
    /// Version being upgraded from
    pub fn from_version(&self) -> u32 {
        self.from
    }

    /// Version being upgraded to
    pub fn to_version(&self) -> u32 {
        self.from + 1
    }

    /// Pre-migration snapshot
    pub fn read_transaction(&self) -> &ReadTransaction {
        self.read
    }

    /// The step's write transaction
    pub fn write_transaction(&mut self) -> &mut WriteTransaction<'env> {
        &mut *self.tx
    }

    /// Document storage facade
    pub fn documents(&mut self) -> DocumentsStorage<'_, 'env> {
        DocumentsStorage {
            read: self.read,
            tx: &mut *self.tx,
        }
    }

    /// Configuration storage facade
    pub fn configuration(&mut self) -> ConfigurationStorage<'_, 'env> {
        ConfigurationStorage { tx: &mut *self.tx }
    }
}

/// One migration step.
pub trait SchemaUpdate: Send + Sync {
    /// Short description for logs
    fn description(&self) -> &str;

    /// Apply the migration inside `step`'s write transaction
    fn update(&self, step: &mut UpdateStep<'_, '_>) -> Result<()>;
}

struct FnUpdate<F> {
    description: String,
    f: F,
}

impl<F> SchemaUpdate for FnUpdate<F>
where
    F: Fn(&mut UpdateStep<'_, '_>) -> Result<()> + Send + Sync,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn update(&self, step: &mut UpdateStep<'_, '_>) -> Result<()> {
        (self.f)(step)
    }
}

/// Registered migration steps, keyed by the version they upgrade from.
#[derive(Default, Clone)]
pub struct SchemaUpgrader {
    steps: BTreeMap<u32, Arc<dyn SchemaUpdate>>,
}

impl SchemaUpgrader {
    /// No steps
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step that upgrades from `from` to `from + 1`, replacing
    /// any previous one.
    pub fn register(&mut self, from: u32, update: impl SchemaUpdate + 'static) -> &mut Self {
        self.steps.insert(from, Arc::new(update));
        self
    }

    /// Register a closure step
    pub fn register_fn<F>(&mut self, from: u32, description: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut UpdateStep<'_, '_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(
            from,
            FnUpdate {
                description: description.into(),
                f,
            },
        )
    }

    /// Highest version reachable from 0 with the registered steps
    pub fn latest_version(&self) -> u32 {
        let mut version = 0;
        while self.steps.contains_key(&version) {
            version += 1;
        }
        version
    }

    /// Stored schema version of `env`
    pub fn current_version(env: &Environment) -> Result<u32> {
        schema_version(&env.read_transaction())
    }

    /// Upgrade the stored schema to `target`, one committed step at a time.
    ///
    /// Returns the version reached (always `target` on success).
    ///
    /// # Errors
    ///
    /// `Upgrade { from, to, .. }` if a step fails or is missing, or if the
    /// stored version is newer than `target`. Steps committed before the
    /// failure stay committed.
    pub fn upgrade_to(&self, env: &Environment, target: u32) -> Result<u32> {
        loop {
            let mut tx = env.write_transaction();
            let version = schema_version(&tx)?;
            if version == target {
                return Ok(version);
            }
            if version > target {
                return Err(Error::Upgrade {
                    from: version,
                    to: target,
                    message: "stored schema is newer than this build supports".to_string(),
                });
            }
            let next = version + 1;
            let Some(update) = self.steps.get(&version) else {
                return Err(Error::Upgrade {
                    from: version,
                    to: next,
                    message: "no upgrade step registered".to_string(),
                });
            };

            info!(
                target: "quarry::upgrade",
                from = version,
                to = next,
                step = update.description(),
                "Applying schema upgrade"
            );
            let read = env.read_transaction();
            let outcome = {
                let mut step = UpdateStep {
                    from: version,
                    read: &read,
                    tx: &mut tx,
                };
                update.update(&mut step)
            };
            drop(read);

            if let Err(e) = outcome {
                warn!(
                    target: "quarry::upgrade",
                    from = version,
                    to = next,
                    error = %e,
                    "Schema upgrade failed, rolling back"
                );
                drop(tx);
                return Err(Error::Upgrade {
                    from: version,
                    to: next,
                    message: e.to_string(),
                });
            }

            tx.tree_put(
                CONFIGURATION_TREE,
                SCHEMA_VERSION_KEY,
                next.to_le_bytes().to_vec(),
            );
            tx.commit().map_err(|e| Error::Upgrade {
                from: version,
                to: next,
                message: e.to_string(),
            })?;
        }
    }
}

impl fmt::Debug for SchemaUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.steps.iter().map(|(from, step)| (from, step.description())))
            .finish()
    }
}
