//! Transactional storage engine for Quarry
//!
//! This crate implements the storage collaborator the indexing pipeline runs on:
//! - Environment: single-writer, multi-reader store with snapshot isolation
//! - ReadTransaction / WriteTransaction: snapshot reads, buffered writes,
//!   one visibility boundary at commit
//! - Etag-ordered document and tombstone tables with per-collection indices
//! - Named trees for configuration and index metadata
//! - Segment blobs exposed as `MappedRegion`s (mmap-backed on disk)
//! - Commit journal with CRC-checked records, replayed on open
//!
//! # Concurrency
//!
//! Readers clone an `Arc` of the committed state and never block. The writer
//! holds a mutex for the lifetime of its transaction and publishes the new
//! state by swapping the `Arc` at commit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod durability;
pub mod environment;
mod journal;
pub mod mapped;
mod state;
pub mod transaction;

pub use durability::DurabilityMode;
pub use journal::JOURNAL_FILE_NAME;
pub use environment::{Environment, EnvironmentOptions};
pub use mapped::{MappedRegion, RegionBacking};
pub use transaction::{ReadTransaction, TreeReader, WriteTransaction};
