//! Stored-entries segment format
//!
//! An index can freeze its entries into one immutable blob, published in the
//! storage environment and read back through [`IndexInput`]. Records are
//! sorted by key and framed with LEB128 lengths.
//!
//! # Format
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic "QSEG" | version u32 LE | count u32 LE │
//! ├──────────────────────────────────────────────┤
//! │ record: vint key_len | key | vlong etag |    │
//! │         vint payload_len | payload (msgpack) │
//! │ ...                                          │
//! ├──────────────────────────────────────────────┤
//! │ crc32 u32 LE over everything above           │
//! └──────────────────────────────────────────────┘
//! ```

use crate::input::IndexInput;
use crate::metadata::IndexEntry;
use quarry_core::{Error, Etag, Result};

const SEGMENT_MAGIC: &[u8; 4] = b"QSEG";
const SEGMENT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 12;
const TRAILER_SIZE: u64 = 4;
const CHECKSUM_CHUNK: usize = 8192;

/// Encode a u32 as LEB128.
pub(crate) fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a u64 as LEB128.
pub(crate) fn encode_varlong(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// One decoded segment record
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    /// Lower-cased document id
    pub key: String,
    /// Etag of the document version the entry came from
    pub etag: Etag,
    /// Stored entry
    pub entry: IndexEntry,
}

/// Builds a segment blob from entries in ascending key order.
#[derive(Debug)]
pub struct SegmentWriter {
    buf: Vec<u8>,
    count: u32,
    last_key: Option<String>,
}

impl Default for SegmentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentWriter {
    /// Empty writer
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(SEGMENT_MAGIC);
        buf.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        Self {
            buf,
            count: 0,
            last_key: None,
        }
    }

    /// Append a record.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `key` does not sort after the previous key.
    pub fn add(&mut self, key: &str, entry: &IndexEntry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_str() {
                return Err(Error::invalid_input(format!(
                    "segment keys must be strictly ascending: '{}' after '{}'",
                    key, last
                )));
            }
        }
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::invalid_input("segment key too long"))?;
        let payload = rmp_serde::to_vec(entry)?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| Error::invalid_input("segment entry too large"))?;

        encode_varint(key_len, &mut self.buf);
        self.buf.extend_from_slice(key.as_bytes());
        encode_varlong(entry.etag, &mut self.buf);
        encode_varint(payload_len, &mut self.buf);
        self.buf.extend_from_slice(&payload);

        self.count += 1;
        self.last_key = Some(key.to_string());
        Ok(())
    }

    /// Records added so far
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Seal the segment and return its bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        let crc = crc32fast::hash(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

/// Sequential reader over a segment, with keyed lookup on a cloned cursor.
#[derive(Debug)]
pub struct SegmentReader<I> {
    input: I,
    count: u32,
    remaining: u32,
}

fn read_record<R: IndexInput + ?Sized>(input: &mut R) -> Result<SegmentRecord> {
    let key = input.read_string()?;
    let etag = input.read_vlong()?;
    let payload_len = input.read_vint()? as usize;
    let payload = input.read_vec(payload_len)?;
    let entry: IndexEntry = rmp_serde::from_slice(&payload)?;
    Ok(SegmentRecord { key, etag, entry })
}

impl<I: IndexInput> SegmentReader<I> {
    /// Validate the header and checksum, leaving the cursor on the first record.
    ///
    /// # Errors
    ///
    /// `Corruption` for a bad magic, version or checksum.
    pub fn open(mut input: I) -> Result<Self> {
        let len = input.len()?;
        if len < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::corruption(format!(
                "segment of {} bytes is smaller than its framing",
                len
            )));
        }

        // Checksum on a clone so the primary cursor stays at the header.
        let mut check = input.clone_input()?;
        check.seek(0)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut chunk = [0u8; CHECKSUM_CHUNK];
        let mut remaining = len - TRAILER_SIZE;
        while remaining > 0 {
            let n = remaining.min(CHECKSUM_CHUNK as u64) as usize;
            check.read_bytes(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }
        let stored_crc = check.read_u32()?;
        let actual_crc = hasher.finalize();
        if stored_crc != actual_crc {
            return Err(Error::corruption(format!(
                "segment checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_crc, actual_crc
            )));
        }

        input.seek(0)?;
        let mut magic = [0u8; 4];
        input.read_bytes(&mut magic)?;
        if &magic != SEGMENT_MAGIC {
            return Err(Error::corruption("bad segment magic"));
        }
        let version = input.read_u32()?;
        if version != SEGMENT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        let count = input.read_u32()?;
        Ok(Self {
            input,
            count,
            remaining: count,
        })
    }

    /// Number of records in the segment
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Find a record by key without moving this reader.
    pub fn find(&self, key: &str) -> Result<Option<SegmentRecord>> {
        let mut cursor = self.input.clone_input()?;
        cursor.seek(HEADER_SIZE as i64)?;
        for _ in 0..self.count {
            let record = read_record(&mut *cursor)?;
            match record.key.as_str().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Give back the underlying input
    pub fn into_inner(self) -> I {
        self.input
    }
}

impl<I: IndexInput> Iterator for SegmentReader<I> {
    type Item = Result<SegmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match read_record(&mut self.input) {
            Ok(record) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
