//! Document database facade
//!
//! Ties the pieces together: a storage environment, the `quarry.toml`
//! configuration, the schema upgrader and the index store.
//!
//! # Flow of `open`
//!
//! 1. Create the data directory if needed
//! 2. Read or create `quarry.toml`
//! 3. Open the storage environment (journal replay, segment recovery)
//! 4. Upgrade the stored schema to [`SCHEMA_VERSION`]
//! 5. Read the database id stamped by the first upgrade step

use crate::config::{QuarryConfig, CONFIG_FILE_NAME};
use crate::index::{Index, IndexDefinition, IndexStore};
use crate::staleness;
use crate::upgrade::{SchemaUpgrader, CONFIGURATION_TREE};
use crate::worker::{CycleStats, MapWorker};
use quarry_core::{Document, Error, Etag, Result};
use quarry_storage::{Environment, EnvironmentOptions, TreeReader};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Configuration key holding the database id
pub const DATABASE_ID_KEY: &str = "database_id";

/// Upgrade steps known to this build.
pub fn builtin_upgrades() -> SchemaUpgrader {
    let mut upgrader = SchemaUpgrader::new();
    upgrader.register_fn(0, "stamp database id", |step| {
        let mut config = step.configuration();
        if config.get(DATABASE_ID_KEY)?.is_none() {
            config.put(DATABASE_ID_KEY, Uuid::new_v4().to_string());
        }
        Ok(())
    });
    upgrader
}

fn read_database_id<R: TreeReader + ?Sized>(reader: &R) -> Result<Uuid> {
    let raw = reader
        .tree_get(CONFIGURATION_TREE, DATABASE_ID_KEY.as_bytes())?
        .ok_or_else(|| Error::corruption("database id missing after upgrade"))?;
    let text = std::str::from_utf8(&raw)
        .map_err(|_| Error::corruption("database id is not UTF-8"))?;
    Uuid::parse_str(text).map_err(|e| Error::corruption(format!("invalid database id: {}", e)))
}

/// An embedded document database with map indexes.
///
/// Thread safety: `DocumentDatabase` is `Send + Sync`. Writers serialize on
/// the environment's writer lock; indexing and staleness checks can run from
/// any thread.
#[derive(Debug)]
pub struct DocumentDatabase {
    env: Environment,
    config: QuarryConfig,
    indexes: IndexStore,
    worker: MapWorker,
    database_id: Uuid,
}

impl DocumentDatabase {
    /// Open (or create) a database in `path`, configured by its `quarry.toml`.
    ///
    /// # Errors
    ///
    /// `Config` for an unreadable or invalid config file, the environment's
    /// open errors, or `Upgrade` if the stored schema cannot be brought to
    /// [`SCHEMA_VERSION`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data_dir = path.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        QuarryConfig::write_default_if_missing(&config_path)?;
        let config = QuarryConfig::from_file(&config_path)?;
        Self::open_environment(data_dir, config)
    }

    /// Open with an explicit configuration.
    ///
    /// The configuration is written to `quarry.toml` so later `open` calls
    /// pick up the same settings.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: QuarryConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = path.as_ref();
        std::fs::create_dir_all(data_dir)?;
        config.write_to_file(&data_dir.join(CONFIG_FILE_NAME))?;
        Self::open_environment(data_dir, config)
    }

    /// Database with no files, lost when dropped.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(QuarryConfig::default())
    }

    /// In-memory database with explicit indexing settings.
    pub fn in_memory_with(config: QuarryConfig) -> Result<Self> {
        Self::from_environment(Environment::in_memory(), config)
    }

    fn open_environment(data_dir: &Path, config: QuarryConfig) -> Result<Self> {
        let options = EnvironmentOptions {
            durability: config.durability_mode()?,
        };
        let env = Environment::open(data_dir, options)?;
        Self::from_environment(env, config)
    }

    fn from_environment(env: Environment, config: QuarryConfig) -> Result<Self> {
        let worker = MapWorker::new(config.worker_options()?);
        builtin_upgrades().upgrade_to(&env, SCHEMA_VERSION)?;
        let database_id = read_database_id(&env.read_transaction())?;

        info!(
            target: "quarry::db",
            %database_id,
            durability = env.durability().description(),
            schema_version = SCHEMA_VERSION,
            "Opened database"
        );
        Ok(Self {
            env,
            config,
            indexes: IndexStore::new(),
            worker,
            database_id,
        })
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Store a document in its own transaction, returning its new etag.
    pub fn put(&self, id: &str, collection: &str, data: serde_json::Value) -> Result<Etag> {
        let mut tx = self.env.write_transaction();
        let etag = tx.put_document(id, collection, data)?;
        tx.commit()?;
        Ok(etag)
    }

    /// Delete a document, returning the tombstone etag if it existed.
    pub fn delete(&self, id: &str) -> Result<Option<Etag>> {
        let mut tx = self.env.write_transaction();
        let etag = tx.delete_document(id)?;
        tx.commit()?;
        Ok(etag)
    }

    /// Latest committed version of a document
    pub fn get(&self, id: &str) -> Option<Arc<Document>> {
        self.env.read_transaction().document(id)
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Register an index. It starts stale and catches up on the next run.
    pub fn create_index(&self, definition: IndexDefinition) -> Result<Arc<Index>> {
        self.indexes.register(definition)
    }

    /// Remove an index and everything it stored.
    ///
    /// # Errors
    ///
    /// `NotFound` if no index has that name.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        if self.indexes.remove(&self.env, name)? {
            Ok(())
        } else {
            Err(Error::not_found(format!("index '{}'", name)))
        }
    }

    /// Look up an index
    pub fn index(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.get(name)
    }

    /// Registered indexes
    pub fn indexes(&self) -> &IndexStore {
        &self.indexes
    }

    /// Run one cycle of every registered index.
    ///
    /// An index removed mid-run is skipped rather than failing the others.
    pub fn run_indexing(&self) -> Result<CycleStats> {
        let mut total = CycleStats::default();
        for index in self.indexes.all() {
            match self.worker.run_all(&self.env, &index) {
                Ok(stats) => total += stats,
                Err(Error::Cancelled) if self.indexes.get(index.name()).is_none() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Run one cycle of the named index.
    pub fn run_index(&self, name: &str) -> Result<CycleStats> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| Error::not_found(format!("index '{}'", name)))?;
        self.worker.run_all(&self.env, &index)
    }

    /// Number of indexes behind the store, judged on one snapshot
    pub fn stale_index_count(&self) -> Result<usize> {
        staleness::count_stale_indexes(&self.env, &self.indexes)
    }

    /// True if the named index is behind the store
    pub fn is_index_stale(&self, name: &str) -> Result<bool> {
        let index = self
            .indexes
            .get(name)
            .ok_or_else(|| Error::not_found(format!("index '{}'", name)))?;
        index.is_stale(&self.env.read_transaction())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Id stamped when the database was created
    pub fn database_id(&self) -> Uuid {
        self.database_id
    }

    /// Stored schema version
    pub fn schema_version(&self) -> Result<u32> {
        SchemaUpgrader::current_version(&self.env)
    }

    /// Underlying storage environment
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Configuration in effect
    pub fn config(&self) -> &QuarryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Fields;
    use quarry_core::Collection;
    use serde_json::json;
    use tempfile::TempDir;

    static_assertions::assert_impl_all!(DocumentDatabase: Send, Sync);

    fn by_name() -> IndexDefinition {
        IndexDefinition::from_fn("users/by-name", vec![Collection::named("Users")], |doc: &Document| {
            Ok(doc
                .data
                .get("name")
                .map(|name| Fields::from([("name".to_string(), name.clone())])))
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_is_upgraded() {
        let db = DocumentDatabase::in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        assert_ne!(db.database_id(), Uuid::nil());
    }

    #[test]
    fn test_index_lifecycle() {
        let db = DocumentDatabase::in_memory().unwrap();
        db.put("users/1", "Users", json!({"name": "ann"})).unwrap();
        db.put("users/2", "Users", json!({"age": 3})).unwrap();
        let index = db.create_index(by_name()).unwrap();
        assert_eq!(db.stale_index_count().unwrap(), 1);

        let stats = db.run_indexing().unwrap();
        assert_eq!(stats.mapped, 1);
        assert_eq!(db.stale_index_count().unwrap(), 0);
        assert!(!db.is_index_stale("users/by-name").unwrap());

        let tx = db.environment().read_transaction();
        let entry = index.entry(&tx, "USERS/1").unwrap().unwrap();
        assert_eq!(entry.fields["name"], json!("ann"));
        assert!(index.entry(&tx, "users/2").unwrap().is_none());
        drop(tx);

        db.delete("users/1").unwrap();
        assert!(db.is_index_stale("users/by-name").unwrap());
        db.run_index("users/by-name").unwrap();
        let tx = db.environment().read_transaction();
        assert!(index.entries(&tx).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_index() {
        let db = DocumentDatabase::in_memory().unwrap();
        assert!(matches!(db.run_index("nope"), Err(Error::NotFound(_))));
        assert!(matches!(db.is_index_stale("nope"), Err(Error::NotFound(_))));
        assert!(matches!(db.delete_index("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_index_drops_state() {
        let db = DocumentDatabase::in_memory().unwrap();
        db.put("users/1", "Users", json!({"name": "ann"})).unwrap();
        db.create_index(by_name()).unwrap();
        db.run_indexing().unwrap();
        db.delete_index("users/by-name").unwrap();
        assert!(db.index("users/by-name").is_none());
        assert_eq!(db.stale_index_count().unwrap(), 0);

        // Same name again starts from scratch.
        let index = db.create_index(by_name()).unwrap();
        assert!(index.is_stale(&db.environment().read_transaction()).unwrap());
    }

    #[test]
    fn test_open_creates_config_and_keeps_id() {
        let dir = TempDir::new().unwrap();
        let id = {
            let db = DocumentDatabase::open(dir.path()).unwrap();
            db.put("users/1", "Users", json!({"name": "ann"})).unwrap();
            db.database_id()
        };
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());

        let db = DocumentDatabase::open(dir.path()).unwrap();
        assert_eq!(db.database_id(), id);
        assert_eq!(db.get("users/1").unwrap().data, json!({"name": "ann"}));
    }

    #[test]
    fn test_open_with_config_persists_settings() {
        let dir = TempDir::new().unwrap();
        let mut config = QuarryConfig::default();
        config.durability = "always".to_string();
        config.indexing.map_batch_size = 7;
        drop(DocumentDatabase::open_with_config(dir.path(), config.clone()).unwrap());

        let db = DocumentDatabase::open(dir.path()).unwrap();
        assert_eq!(db.config(), &config);
        assert_eq!(db.environment().durability(), quarry_storage::DurabilityMode::Always);
    }

    #[test]
    fn test_invalid_config_file_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "durability = \"turbo\"\n").unwrap();
        assert!(matches!(DocumentDatabase::open(dir.path()), Err(Error::Config(_))));
    }
}
