//! Map worker: drives an index from its watermarks to the store's head
//!
//! One cycle for one (index, collection) pair:
//!
//! 1. Cleanup: tombstones above the tombstone watermark remove the deleted
//!    documents' entries.
//! 2. Map: documents above the document watermark are run through the
//!    index's map function.
//!
//! Each pass repeats until a page comes back empty. Every batch is committed
//! in a single write transaction that carries both the output and the new
//! watermark, so a crash can only lose whole batches, which are then simply
//! mapped again.
//!
//! # Invariants
//!
//! - The read transaction of a batch is dropped before its write transaction
//!   is opened; the worker never holds the writer lock while reading a page.
//! - Cancellation is checked before every page fetch and before every commit.
//!   A cancelled batch is discarded, never committed partially.
//! - Final index state does not depend on the page size or the time budget.

use crate::extractor::{ItemExtractor, SourceKind};
use crate::index::Index;
use crate::metadata::{
    append_error, put_entry, read_entry, read_watermark, remove_entry, write_watermark,
    IndexEntry, IndexingError,
};
use chrono::Utc;
use quarry_core::{Collection, Error, Etag, Result};
use quarry_storage::Environment;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What to do when map logic fails for one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapErrorPolicy {
    /// Record the failure in the index error log and continue
    #[default]
    Skip,
    /// Commit what was mapped before the failure and return `Error::Map`
    Abort,
}

impl MapErrorPolicy {
    /// Parse the configuration spelling (`"skip"` / `"abort"`)
    pub fn from_config_str(value: &str) -> Result<Self> {
        match value {
            "skip" => Ok(MapErrorPolicy::Skip),
            "abort" => Ok(MapErrorPolicy::Abort),
            other => Err(Error::Config(format!(
                "invalid map error policy '{}', expected \"skip\" or \"abort\"",
                other
            ))),
        }
    }
}

/// Cooperative stop signal for a running cycle.
///
/// Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Irreversible.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail with `Cancelled` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Items per batch, `None` for unbounded
    pub page_size: Option<usize>,
    /// Cut a batch short once it has run this long
    pub max_batch_duration: Option<Duration>,
    /// Per-item failure handling
    pub on_map_error: MapErrorPolicy,
    /// Error log capacity per index
    pub max_stored_errors: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            page_size: Some(1024),
            max_batch_duration: None,
            on_map_error: MapErrorPolicy::Skip,
            max_stored_errors: 100,
        }
    }
}

/// Counters for one or more cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Committed batches
    pub batches: usize,
    /// Documents whose output was written
    pub mapped: usize,
    /// Entries removed (tombstones and documents that no longer map)
    pub removed: usize,
    /// Tombstones processed
    pub tombstones: usize,
    /// Map failures recorded under `Skip`
    pub errors: usize,
}

impl AddAssign for CycleStats {
    fn add_assign(&mut self, other: Self) {
        self.batches += other.batches;
        self.mapped += other.mapped;
        self.removed += other.removed;
        self.tombstones += other.tombstones;
        self.errors += other.errors;
    }
}

enum MapOutcome {
    Put(String, IndexEntry),
    Remove(String),
    Failed(String, IndexingError),
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Runs map cycles. Stateless between calls; share freely.
#[derive(Debug, Clone, Default)]
pub struct MapWorker {
    options: WorkerOptions,
}

impl MapWorker {
    /// Worker with the given options
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }

    /// Current options
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Run one cycle for every collection of the index.
    pub fn run_all(&self, env: &Environment, index: &Index) -> Result<CycleStats> {
        let mut total = CycleStats::default();
        for collection in index.collections() {
            total += self.run_cycle(env, index, collection)?;
        }
        Ok(total)
    }

    /// Bring `index` up to date for `collection`.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if the index's cancellation flag is set
    /// - `Map` under [`MapErrorPolicy::Abort`], after committing the items
    ///   that preceded the failure
    pub fn run_cycle(
        &self,
        env: &Environment,
        index: &Index,
        collection: &Collection,
    ) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        while self.cleanup_batch(env, index, collection, &mut stats)? {}
        while self.map_batch(env, index, collection, &mut stats)? {}
        if stats.batches > 0 {
            info!(
                target: "quarry::indexing",
                index = index.name(),
                %collection,
                batches = stats.batches,
                mapped = stats.mapped,
                removed = stats.removed,
                errors = stats.errors,
                "Index cycle complete"
            );
        }
        Ok(stats)
    }

    fn deadline(&self) -> Option<Instant> {
        self.options
            .max_batch_duration
            .map(|budget| Instant::now() + budget)
    }

    /// One tombstone batch. Returns false when there was nothing to do.
    fn cleanup_batch(
        &self,
        env: &Environment,
        index: &Index,
        collection: &Collection,
        stats: &mut CycleStats,
    ) -> Result<bool> {
        let name = index.name();
        let cancellation = index.cancellation();
        cancellation.check()?;

        let deadline = self.deadline();
        let mut deleted: Vec<(String, Etag)> = Vec::new();
        {
            let tx = env.read_transaction();
            let since = read_watermark(&tx, name, SourceKind::Tombstone, collection)?;
            let page = ItemExtractor::tombstones().next_page(
                &tx,
                collection,
                since,
                self.options.page_size,
            )?;
            for item in page {
                let item = item?;
                deleted.push((item.lower_id().to_string(), item.etag()));
                if deadline_passed(deadline) {
                    break;
                }
            }
        }
        let Some(&(_, last_etag)) = deleted.last() else {
            return Ok(false);
        };

        let mut tx = env.write_transaction();
        let mut removed = 0;
        for (lower_id, tombstone_etag) in &deleted {
            // An entry newer than the delete came from a later put.
            if let Some(entry) = read_entry(&tx, name, lower_id)? {
                if entry.etag < *tombstone_etag {
                    remove_entry(&mut tx, name, lower_id);
                    removed += 1;
                }
            }
        }
        write_watermark(&mut tx, name, SourceKind::Tombstone, collection, last_etag)?;
        cancellation.check()?;
        tx.commit()?;

        stats.batches += 1;
        stats.tombstones += deleted.len();
        stats.removed += removed;
        debug!(
            target: "quarry::indexing",
            index = name,
            %collection,
            batch = deleted.len(),
            removed,
            etag = last_etag,
            "Committed tombstone batch"
        );
        Ok(true)
    }

    /// One document batch. Returns false when there was nothing to do.
    fn map_batch(
        &self,
        env: &Environment,
        index: &Index,
        collection: &Collection,
        stats: &mut CycleStats,
    ) -> Result<bool> {
        let name = index.name();
        let cancellation = index.cancellation();
        cancellation.check()?;

        let deadline = self.deadline();
        let mut outcomes = Vec::new();
        let mut last_etag = None;
        let mut failure = None;
        {
            let tx = env.read_transaction();
            let since = read_watermark(&tx, name, SourceKind::Document, collection)?;
            let page = ItemExtractor::documents().next_page(
                &tx,
                collection,
                since,
                self.options.page_size,
            )?;
            for item in page {
                let item = item?;
                let lower_id = item.lower_id().to_string();
                let outcome = match index.map_document(item.document()?) {
                    Ok(Some(fields)) => MapOutcome::Put(
                        lower_id,
                        IndexEntry {
                            document_id: item.id().to_string(),
                            collection: item.collection().to_string(),
                            etag: item.etag(),
                            fields,
                        },
                    ),
                    Ok(None) => MapOutcome::Remove(lower_id),
                    Err(e) => match self.options.on_map_error {
                        MapErrorPolicy::Skip => {
                            warn!(
                                target: "quarry::indexing",
                                index = name,
                                document = item.id(),
                                etag = item.etag(),
                                error = %e,
                                "Map failed, skipping document"
                            );
                            MapOutcome::Failed(
                                lower_id,
                                IndexingError {
                                    index: name.to_string(),
                                    document_id: item.id().to_string(),
                                    etag: item.etag(),
                                    message: e.to_string(),
                                    timestamp: Utc::now(),
                                },
                            )
                        }
                        MapErrorPolicy::Abort => {
                            failure = Some(Error::Map {
                                index: name.to_string(),
                                document_id: item.id().to_string(),
                                etag: item.etag(),
                                message: e.to_string(),
                            });
                            break;
                        }
                    },
                };
                outcomes.push(outcome);
                last_etag = Some(item.etag());
                if deadline_passed(deadline) {
                    break;
                }
            }
        }

        if let Some(last_etag) = last_etag {
            let batch = outcomes.len();
            let mut tx = env.write_transaction();
            for outcome in outcomes {
                match outcome {
                    MapOutcome::Put(lower_id, entry) => {
                        put_entry(&mut tx, name, &lower_id, &entry)?;
                        stats.mapped += 1;
                    }
                    MapOutcome::Remove(lower_id) => {
                        remove_entry(&mut tx, name, &lower_id);
                        stats.removed += 1;
                    }
                    MapOutcome::Failed(lower_id, error) => {
                        remove_entry(&mut tx, name, &lower_id);
                        append_error(&mut tx, &error, self.options.max_stored_errors)?;
                        stats.errors += 1;
                    }
                }
            }
            write_watermark(&mut tx, name, SourceKind::Document, collection, last_etag)?;
            cancellation.check()?;
            tx.commit()?;
            stats.batches += 1;
            debug!(
                target: "quarry::indexing",
                index = name,
                %collection,
                batch,
                etag = last_etag,
                "Committed map batch"
            );
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(last_etag.is_some()),
        }
    }
}
