//! Commit journal file and record format.
//!
//! Every committed write transaction is appended as one record; replay on open
//! rebuilds the environment state. A record is either fully present with a
//! valid checksum or treated as the torn tail of a crash and truncated.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (24 bytes)                  │
//! │   magic "QWAL" | version u32 LE    │
//! │   environment uuid (16)            │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────────────┬──────────────┬────────────────────┬──────────┐
//! │ Payload len (4)  │ TxId (8)     │ Payload (msgpack)  │ CRC32 (4)│
//! └──────────────────┴──────────────┴────────────────────┴──────────┘
//! ```
//!
//! The CRC covers the tx id and the payload.

use crate::durability::DurabilityMode;
use crate::state::WalOp;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use quarry_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Journal file name inside the environment directory
pub const JOURNAL_FILE_NAME: &str = "journal.wal";

/// Magic bytes identifying a journal file
const JOURNAL_MAGIC: &[u8; 4] = b"QWAL";
/// Current journal format version
const JOURNAL_FORMAT_VERSION: u32 = 1;
/// Header size: magic(4) + version(4) + uuid(16)
const HEADER_SIZE: usize = 24;
/// Fixed bytes around a payload: len(4) + tx_id(8) + crc(4)
const RECORD_OVERHEAD: usize = 16;

/// One committed write set
#[derive(Debug, Clone)]
pub(crate) struct JournalRecord {
    pub(crate) tx_id: u64,
    pub(crate) ops: Vec<WalOp>,
}

/// Why a record could not be decoded
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecordError {
    /// Fewer bytes than the record claims (torn write)
    InsufficientData,
    /// Stored checksum does not match the content
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Checksum valid but the payload is not a write set
    Decode(String),
}

fn checksum(tx_id: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&tx_id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl JournalRecord {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec(&self.ops)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| Error::invalid_input("write set too large for one journal record"))?;
        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + payload.len());
        buf.write_u32::<LittleEndian>(payload_len)?;
        buf.write_u64::<LittleEndian>(self.tx_id)?;
        buf.extend_from_slice(&payload);
        buf.write_u32::<LittleEndian>(checksum(self.tx_id, &payload))?;
        Ok(buf)
    }

    /// Decode one record from the front of `buf`, returning it and its size.
    pub(crate) fn from_bytes(buf: &[u8]) -> std::result::Result<(Self, usize), RecordError> {
        if buf.len() < RECORD_OVERHEAD {
            return Err(RecordError::InsufficientData);
        }
        let mut cursor = buf;
        let payload_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| RecordError::InsufficientData)? as usize;
        let tx_id = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| RecordError::InsufficientData)?;
        let total = RECORD_OVERHEAD + payload_len;
        if buf.len() < total {
            return Err(RecordError::InsufficientData);
        }
        let payload = &buf[12..12 + payload_len];
        let mut crc_bytes = &buf[12 + payload_len..total];
        let expected = crc_bytes
            .read_u32::<LittleEndian>()
            .map_err(|_| RecordError::InsufficientData)?;
        let actual = checksum(tx_id, payload);
        if expected != actual {
            return Err(RecordError::ChecksumMismatch { expected, actual });
        }
        let ops: Vec<WalOp> =
            rmp_serde::from_slice(payload).map_err(|e| RecordError::Decode(e.to_string()))?;
        Ok((JournalRecord { tx_id, ops }, total))
    }
}

/// Result of reading an existing journal
#[derive(Debug)]
pub(crate) struct JournalReplay {
    pub(crate) env_id: Uuid,
    pub(crate) records: Vec<JournalRecord>,
    /// Bytes dropped from a torn or corrupt tail
    pub(crate) truncated_bytes: u64,
}

/// Append-only journal writer
#[derive(Debug)]
pub(crate) struct Journal {
    file: File,
    path: PathBuf,
    durability: DurabilityMode,
    write_position: u64,
}

impl Journal {
    /// Open (or create) the journal in `dir` and read back its records.
    ///
    /// A torn or checksum-failing tail is truncated so new appends start on a
    /// record boundary.
    pub(crate) fn open(dir: &Path, durability: DurabilityMode) -> Result<(Journal, JournalReplay)> {
        let path = dir.join(JOURNAL_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.is_empty() {
            let env_id = Uuid::new_v4();
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(JOURNAL_MAGIC);
            header.write_u32::<LittleEndian>(JOURNAL_FORMAT_VERSION)?;
            header.extend_from_slice(env_id.as_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
            debug!(target: "quarry::storage", path = ?path, "Created journal");
            let journal = Journal {
                file,
                path,
                durability,
                write_position: HEADER_SIZE as u64,
            };
            return Ok((
                journal,
                JournalReplay {
                    env_id,
                    records: Vec::new(),
                    truncated_bytes: 0,
                },
            ));
        }

        let env_id = Self::read_header(&buf)?;
        let mut records = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < buf.len() {
            match JournalRecord::from_bytes(&buf[offset..]) {
                Ok((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                }
                Err(RecordError::InsufficientData) => {
                    warn!(target: "quarry::storage", offset, "Partial journal record at tail");
                    break;
                }
                Err(RecordError::ChecksumMismatch { expected, actual }) => {
                    warn!(
                        target: "quarry::storage",
                        offset,
                        expected,
                        actual,
                        "Journal checksum mismatch, discarding tail"
                    );
                    break;
                }
                Err(RecordError::Decode(detail)) => {
                    return Err(Error::corruption(format!(
                        "journal record at offset {} is not a write set: {}",
                        offset, detail
                    )));
                }
            }
        }

        let valid_end = offset as u64;
        let truncated_bytes = buf.len() as u64 - valid_end;
        if truncated_bytes > 0 {
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        Ok((
            Journal {
                file,
                path,
                durability,
                write_position: valid_end,
            },
            JournalReplay {
                env_id,
                records,
                truncated_bytes,
            },
        ))
    }

    fn read_header(buf: &[u8]) -> Result<Uuid> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::corruption("journal too small for header"));
        }
        if &buf[0..4] != JOURNAL_MAGIC {
            return Err(Error::corruption("bad journal magic"));
        }
        let mut version_bytes = &buf[4..8];
        let version = version_bytes.read_u32::<LittleEndian>()?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported journal version {}",
                version
            )));
        }
        let id_bytes: [u8; 16] = buf[8..24]
            .try_into()
            .map_err(|_| Error::corruption("bad journal header"))?;
        Ok(Uuid::from_bytes(id_bytes))
    }

    /// Cut the file back to the last record boundary after a failed write.
    ///
    /// If the cut itself fails the journal is left with a torn tail, which the
    /// next open drops.
    fn rewind(&mut self) {
        if let Err(e) = self.file.set_len(self.write_position) {
            warn!(
                target: "quarry::storage",
                path = %self.path.display(),
                position = self.write_position,
                error = %e,
                "Failed to truncate journal after a failed append"
            );
        }
        if let Err(e) = self.file.seek(SeekFrom::Start(self.write_position)) {
            warn!(
                target: "quarry::storage",
                path = %self.path.display(),
                position = self.write_position,
                error = %e,
                "Failed to reposition journal after a failed append"
            );
        }
    }

    /// Append a record, honoring the durability mode.
    ///
    /// On a failed write the file is cut back to the previous record boundary.
    pub(crate) fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        if let Err(e) = self.file.write_all(&bytes) {
            self.rewind();
            return Err(e.into());
        }
        if self.durability.requires_immediate_fsync() {
            self.file.sync_data()?;
        } else {
            self.file.flush()?;
        }
        self.write_position += bytes.len() as u64;
        Ok(())
    }

    /// Path of the journal file
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
