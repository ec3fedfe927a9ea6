//! QuarryDB - embedded document database with incremental map indexes
//!
//! Documents are JSON values stored under an id and a collection. Every commit
//! stamps its writes with a monotonically increasing etag; map indexes follow
//! those etags and stay incrementally up to date.
//!
//! # Quick Start
//!
//! ```ignore
//! use quarrydb::{Collection, DocumentDatabase, Fields, IndexDefinition};
//!
//! let db = DocumentDatabase::open("/path/to/data")?;
//! db.put("users/1", "Users", serde_json::json!({ "name": "ann" }))?;
//!
//! db.create_index(IndexDefinition::from_fn(
//!     "users/by-name",
//!     vec![Collection::named("Users")],
//!     |doc| Ok(doc.data.get("name").map(|n| Fields::from([("name".into(), n.clone())]))),
//! )?)?;
//! db.run_indexing()?;
//! assert_eq!(db.stale_index_count()?, 0);
//! ```
//!
//! # Architecture
//!
//! - `quarry-core`: shared types, errors and the document read contract
//! - `quarry-storage`: transactional environment, journal, mapped segments
//! - `quarry-engine`: extraction, map worker, staleness, upgrades, facade

pub use quarry_core::{Collection, Document, Error, Etag, Result, Tombstone};
pub use quarry_engine::*;
pub use quarry_storage::{
    DurabilityMode, Environment, EnvironmentOptions, ReadTransaction, TreeReader,
    WriteTransaction,
};
