//! Storage environment: open, recover, and hand out transactions
//!
//! An environment is either purely in memory or rooted at a data directory:
//!
//! ```text
//! <dir>/
//!   .lock          exclusive fs2 lock, held while open
//!   journal.wal    commit journal
//!   segments/      segment blobs, one immutable file per published version
//! ```
//!
//! Opening replays the journal into a fresh state and removes segment files
//! that no committed state references (left by a crash between the segment
//! write and the journal append, or by a replaced version).

use crate::durability::DurabilityMode;
use crate::journal::{Journal, JournalRecord};
use crate::mapped::RegionBacking;
use crate::state::{EnvState, WalOp};
use crate::transaction::{ReadTransaction, WriteTransaction};
use parking_lot::{Mutex, RwLock};
use quarry_core::{Error, Etag, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory holding segment files
const SEGMENTS_DIR: &str = "segments";
/// Lock file name
const LOCK_FILE: &str = ".lock";

/// Options for [`Environment::open`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentOptions {
    /// When commits reach stable storage
    pub durability: DurabilityMode,
}

/// State owned by the single writer
#[derive(Debug)]
pub(crate) struct WriterState {
    pub(crate) journal: Option<Journal>,
}

/// Transactional store: one writer, any number of snapshot readers.
///
/// Thread safety: `Environment` is `Send + Sync`; share it with `Arc`.
/// Readers never wait on the writer.
pub struct Environment {
    id: Uuid,
    path: Option<PathBuf>,
    segments_dir: Option<PathBuf>,
    durability: DurabilityMode,
    pub(crate) state: RwLock<Arc<EnvState>>,
    writer: Mutex<WriterState>,
    // Held for the lifetime of the environment; the OS lock goes with the handle.
    _lock_file: Option<File>,
}

impl Environment {
    /// Create an environment that keeps everything in memory.
    pub fn in_memory() -> Self {
        let id = Uuid::new_v4();
        debug!(target: "quarry::storage", %id, "Opened in-memory environment");
        Self {
            id,
            path: None,
            segments_dir: None,
            durability: DurabilityMode::InMemory,
            state: RwLock::new(Arc::new(EnvState::default())),
            writer: Mutex::new(WriterState { journal: None }),
            _lock_file: None,
        }
    }

    /// Open (or create) a persistent environment at `path`.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `options.durability` is `InMemory`
    /// - `InvalidOperation` if another process holds the directory lock
    /// - `Corruption` if the journal header is invalid or a committed segment
    ///   file is missing
    pub fn open(path: impl AsRef<Path>, options: EnvironmentOptions) -> Result<Self> {
        if !options.durability.requires_journal() {
            return Err(Error::invalid_input(
                "in-memory durability has no data directory, use Environment::in_memory",
            ));
        }
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;
        let segments_dir = path.join(SEGMENTS_DIR);
        fs::create_dir_all(&segments_dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            Error::invalid_operation(format!(
                "data directory '{}' is already in use by another process",
                path.display()
            ))
        })?;

        let (journal, replay) = Journal::open(&path, options.durability)?;
        let records = replay.records.len();
        let state = recover_state(&segments_dir, &replay.records)?;
        remove_orphan_segments(&segments_dir, &state);

        info!(
            target: "quarry::storage",
            path = %path.display(),
            id = %replay.env_id,
            records,
            truncated_bytes = replay.truncated_bytes,
            last_etag = state.last_etag,
            journal = %journal.path().display(),
            "Opened environment"
        );

        Ok(Self {
            id: replay.env_id,
            path: Some(path),
            segments_dir: Some(segments_dir),
            durability: options.durability,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(WriterState {
                journal: Some(journal),
            }),
            _lock_file: Some(lock_file),
        })
    }

    /// Begin a snapshot read. Never blocks on the writer.
    pub fn read_transaction(&self) -> ReadTransaction {
        ReadTransaction::new(Arc::clone(&*self.state.read()))
    }

    /// Begin the write transaction, waiting for the current writer to finish.
    pub fn write_transaction(&self) -> WriteTransaction<'_> {
        let writer = self.writer.lock();
        // Taken after the writer lock: no commit can land between the two.
        let base = Arc::clone(&*self.state.read());
        WriteTransaction::new(self, writer, base)
    }

    /// Begin the write transaction only if no other writer is active.
    pub fn try_write_transaction(&self) -> Option<WriteTransaction<'_>> {
        let writer = self.writer.try_lock()?;
        let base = Arc::clone(&*self.state.read());
        Some(WriteTransaction::new(self, writer, base))
    }

    /// Highest committed etag
    pub fn last_etag(&self) -> Etag {
        self.state.read().last_etag
    }

    /// Stable identifier, persisted in the journal header
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Data directory, `None` in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Durability mode
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    pub(crate) fn segments_dir(&self) -> Option<&Path> {
        self.segments_dir.as_deref()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("durability", &self.durability)
            .finish()
    }
}

/// Segment files referenced once every record has been applied
fn final_segment_files(records: &[JournalRecord]) -> BTreeSet<String> {
    let mut live: BTreeMap<&str, &str> = BTreeMap::new();
    for op in records.iter().flat_map(|r| r.ops.iter()) {
        match op {
            WalOp::PutSegment { name, file } => {
                live.insert(name, file);
            }
            WalOp::DeleteSegment { name } => {
                live.remove(name.as_str());
            }
            _ => {}
        }
    }
    live.values().map(|f| f.to_string()).collect()
}

/// Rebuild the committed state from journal records.
fn recover_state(segments_dir: &Path, records: &[JournalRecord]) -> Result<EnvState> {
    let live_files = final_segment_files(records);
    let mut state = EnvState::default();
    for record in records {
        let mut backings = BTreeMap::new();
        for op in &record.ops {
            if let WalOp::PutSegment { name, file } = op {
                // Superseded versions are replaced later in the replay.
                let backing = if live_files.contains(file) {
                    map_segment(segments_dir, file)?
                } else {
                    Arc::new(RegionBacking::Owned(Box::default()))
                };
                backings.insert(name.clone(), backing);
            }
        }
        state.apply(record.tx_id, &record.ops, &backings)?;
    }
    Ok(state)
}

fn map_segment(segments_dir: &Path, file: &str) -> Result<Arc<RegionBacking>> {
    let path = segments_dir.join(file);
    let meta = fs::metadata(&path).map_err(|e| {
        Error::corruption(format!("committed segment file '{}' unreadable: {}", file, e))
    })?;
    if meta.len() == 0 {
        return Ok(Arc::new(RegionBacking::Owned(Box::default())));
    }
    Ok(Arc::new(RegionBacking::map_file(&path)?))
}

/// Delete segment files no committed state refers to. Best effort.
fn remove_orphan_segments(segments_dir: &Path, state: &EnvState) {
    let referenced: BTreeSet<&str> = state.segments.values().map(|s| s.file.as_str()).collect();
    let entries = match fs::read_dir(segments_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(target: "quarry::storage", error = %e, "Cannot list segment directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if referenced.contains(name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => debug!(target: "quarry::storage", file = name, "Removed orphan segment file"),
            Err(e) => warn!(target: "quarry::storage", file = name, error = %e, "Cannot remove orphan segment file"),
        }
    }
}
