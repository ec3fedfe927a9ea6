//! Indexing pipeline for Quarry
//!
//! This crate turns committed documents into index entries:
//! - MappedInput: positioned reader over a mapped segment region, with
//!   independent clones and explicit disposal
//! - ItemExtractor: etag-ordered pages of documents or tombstones as
//!   `IndexItem`s, bound to the caller's read transaction
//! - MapWorker: batch loop that maps pages and commits output together with
//!   the new watermark
//! - Staleness: whether an index has caught up with a snapshot
//! - SchemaUpgrader: step-by-step migration of the stored schema version
//! - DocumentDatabase: facade tying storage, configuration and indexes together
//!
//! All persisted index state (watermarks, entries, error log, segment) lives
//! in the storage environment and changes only inside write transactions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod extractor;
pub mod index;
pub mod input;
pub mod metadata;
pub mod segment;
pub mod staleness;
pub mod upgrade;
pub mod worker;

pub use config::{IndexingConfig, QuarryConfig, CONFIG_FILE_NAME};
pub use database::{DocumentDatabase, SCHEMA_VERSION};
pub use extractor::{IndexItem, ItemExtractor, ItemPage, SourceKind};
pub use index::{Index, IndexDefinition, IndexStore, MapFunction, SegmentSummary};
pub use input::{IndexInput, MappedInput, MappedInputClone};
pub use metadata::{Fields, IndexEntry, IndexingError};
pub use segment::{SegmentReader, SegmentRecord, SegmentWriter};
pub use staleness::{count_stale_indexes, is_stale};
pub use upgrade::{
    ConfigurationStorage, DocumentsStorage, SchemaUpdate, SchemaUpgrader, UpdateStep,
};
pub use worker::{CancellationFlag, CycleStats, MapErrorPolicy, MapWorker, WorkerOptions};
