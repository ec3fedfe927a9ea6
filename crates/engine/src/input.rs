//! Random-access byte input over mapped storage pages
//!
//! The index engine reads its segments through [`IndexInput`], a file-like
//! cursor with many short reads and frequent clones. [`MappedInput`] serves
//! those reads straight out of a [`MappedRegion`] without copying pages.
//!
//! # Ownership
//!
//! There is exactly one original per opened region. The original owns the
//! invalidation flag and is the only type with `dispose`; every
//! [`MappedInputClone`] shares the flag but cannot set it. Disposing the
//! original (or dropping it) invalidates itself and all clones at once.
//!
//! # Memory Ordering
//!
//! - `dispose` stores the flag with `Release`
//! - every operation loads it with `Acquire` before touching the region
//!
//! The region's arena is reference counted by every cursor, so a read that
//! passed the check on another thread still reads mapped memory; only later
//! operations fail with `AlreadyDisposed`.

use byteorder::{ByteOrder, LittleEndian};
use quarry_core::{Error, Result};
use quarry_storage::MappedRegion;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Byte-stream contract the index engine reads segments through.
///
/// Failed reads leave the position unchanged. Nothing is retried.
pub trait IndexInput: Send {
    /// Read one byte and advance.
    ///
    /// # Errors
    ///
    /// `EndOfInput` at the end, `AlreadyDisposed` after release.
    fn read_byte(&mut self) -> Result<u8>;

    /// Fill `dst` exactly and advance by its length.
    ///
    /// # Errors
    ///
    /// `TruncatedRead` if fewer bytes remain.
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Absolute reposition; `position == len` is allowed.
    ///
    /// # Errors
    ///
    /// `InvalidOffset` for a negative position or one past the end.
    fn seek(&mut self, position: i64) -> Result<()>;

    /// Total length in bytes
    fn len(&self) -> Result<u64>;

    /// Current position
    fn position(&self) -> Result<u64>;

    /// Independent cursor at the same position over the same bytes.
    ///
    /// The clone never owns invalidation.
    fn clone_input(&self) -> Result<Box<dyn IndexInput>>;

    /// True for a zero-length input
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read `count` bytes into a new buffer
    fn read_vec(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.read_bytes(&mut buf)?;
        Ok(buf)
    }

    /// Little-endian u32
    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Little-endian u64
    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// LEB128 variable-length u32 (at most 5 bytes)
    fn read_vint(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 35 {
                return Err(Error::corruption("variable-length int overflows u32"));
            }
        }
    }

    /// LEB128 variable-length u64 (at most 10 bytes)
    fn read_vlong(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 70 {
                return Err(Error::corruption("variable-length long overflows u64"));
            }
        }
    }

    /// Length-prefixed (vint) UTF-8 string
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_vint()? as usize;
        let bytes = self.read_vec(len)?;
        String::from_utf8(bytes).map_err(|e| Error::corruption(format!("invalid UTF-8: {}", e)))
    }

    /// Advance by `count` bytes
    fn skip(&mut self, count: u64) -> Result<()> {
        let target = self
            .position()?
            .checked_add(count)
            .and_then(|p| i64::try_from(p).ok())
            .ok_or_else(|| Error::invalid_input("skip past addressable range"))?;
        self.seek(target)
    }
}

/// Shared by the original and all of its clones
struct InputLease {
    region: MappedRegion,
    disposed: AtomicBool,
}

impl InputLease {
    #[inline]
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        self.region.ensure_live()
    }
}

/// Position plus lease; the part originals and clones have in common.
struct Cursor {
    lease: Arc<InputLease>,
    position: u64,
}

impl Cursor {
    fn read_byte(&mut self) -> Result<u8> {
        self.lease.ensure_live()?;
        let byte = self.lease.region.byte_at(self.position)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.lease.ensure_live()?;
        self.lease.region.read_at(self.position, dst)?;
        self.position += dst.len() as u64;
        Ok(())
    }

    fn seek(&mut self, position: i64) -> Result<()> {
        self.lease.ensure_live()?;
        let len = self.lease.region.len();
        match u64::try_from(position) {
            Ok(p) if p <= len => {
                self.position = p;
                Ok(())
            }
            _ => Err(Error::InvalidOffset {
                offset: position,
                length: len,
            }),
        }
    }

    fn len(&self) -> Result<u64> {
        self.lease.ensure_live()?;
        Ok(self.lease.region.len())
    }

    fn position(&self) -> Result<u64> {
        self.lease.ensure_live()?;
        Ok(self.position)
    }

    fn fork(&self) -> Result<MappedInputClone> {
        self.lease.ensure_live()?;
        Ok(MappedInputClone {
            cursor: Cursor {
                lease: Arc::clone(&self.lease),
                position: self.position,
            },
        })
    }
}

/// The original cursor over a mapped region.
///
/// Owns invalidation: [`dispose`](Self::dispose) (or `Drop`) makes every
/// operation on it and on all of its clones fail with `AlreadyDisposed`.
pub struct MappedInput {
    cursor: Cursor,
}

impl MappedInput {
    /// Open an input positioned at 0.
    ///
    /// # Errors
    ///
    /// `AlreadyDisposed` if the region's transaction has already ended.
    pub fn open(region: MappedRegion) -> Result<Self> {
        region.ensure_live()?;
        Ok(Self {
            cursor: Cursor {
                lease: Arc::new(InputLease {
                    region,
                    disposed: AtomicBool::new(false),
                }),
                position: 0,
            },
        })
    }

    /// Typed clone at the current position.
    pub fn try_clone(&self) -> Result<MappedInputClone> {
        self.cursor.fork()
    }

    /// Invalidate this input and every clone. Idempotent.
    pub fn dispose(&self) {
        self.cursor.lease.disposed.store(true, Ordering::Release);
    }

    /// True once disposed (by this input or the region's transaction ending)
    pub fn is_disposed(&self) -> bool {
        self.cursor.lease.ensure_live().is_err()
    }
}

impl Drop for MappedInput {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A cursor cloned from a [`MappedInput`] (directly or from another clone).
///
/// Moves freely between threads; has no way to invalidate the region.
pub struct MappedInputClone {
    cursor: Cursor,
}

impl MappedInputClone {
    /// Typed clone at the current position.
    pub fn try_clone(&self) -> Result<MappedInputClone> {
        self.cursor.fork()
    }
}

macro_rules! forward_index_input {
    ($ty:ty) => {
        impl IndexInput for $ty {
            #[inline]
            fn read_byte(&mut self) -> Result<u8> {
                self.cursor.read_byte()
            }

            fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
                self.cursor.read_bytes(dst)
            }

            fn seek(&mut self, position: i64) -> Result<()> {
                self.cursor.seek(position)
            }

            fn len(&self) -> Result<u64> {
                self.cursor.len()
            }

            fn position(&self) -> Result<u64> {
                self.cursor.position()
            }

            fn clone_input(&self) -> Result<Box<dyn IndexInput>> {
                Ok(Box::new(self.cursor.fork()?))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("position", &self.cursor.position)
                    .field("len", &self.cursor.lease.region.len())
                    .field("live", &self.cursor.lease.ensure_live().is_ok())
                    .finish()
            }
        }
    };
}

forward_index_input!(MappedInput);
forward_index_input!(MappedInputClone);

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(MappedInput: Send, Sync);
    static_assertions::assert_impl_all!(MappedInputClone: Send, Sync);

    fn input(bytes: &[u8]) -> MappedInput {
        MappedInput::open(MappedRegion::detached(bytes.to_vec())).unwrap()
    }

    #[test]
    fn test_read_byte_and_end_of_input() {
        let mut input = input(&[7, 8]);
        assert_eq!(input.read_byte().unwrap(), 7);
        assert_eq!(input.read_byte().unwrap(), 8);
        assert!(matches!(
            input.read_byte(),
            Err(Error::EndOfInput { position: 2 })
        ));
        assert_eq!(input.position().unwrap(), 2);
    }

    #[test]
    fn test_truncated_read_keeps_position() {
        let mut input = input(&[1, 2, 3]);
        input.seek(1).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            input.read_bytes(&mut buf),
            Err(Error::TruncatedRead {
                requested: 4,
                available: 2
            })
        ));
        assert_eq!(input.position().unwrap(), 1);
    }

    #[test]
    fn test_seek_bounds() {
        let mut input = input(&[0; 10]);
        input.seek(10).unwrap();
        assert!(matches!(
            input.seek(11),
            Err(Error::InvalidOffset {
                offset: 11,
                length: 10
            })
        ));
        assert!(matches!(
            input.seek(-1),
            Err(Error::InvalidOffset { offset: -1, .. })
        ));
        assert_eq!(input.position().unwrap(), 10);
    }

    #[test]
    fn test_empty_region() {
        let mut input = input(&[]);
        assert!(input.is_empty().unwrap());
        input.seek(0).unwrap();
        assert!(matches!(
            input.read_byte(),
            Err(Error::EndOfInput { position: 0 })
        ));
        let mut none: [u8; 0] = [];
        input.read_bytes(&mut none).unwrap();
    }

    #[test]
    fn test_varints_and_strings() {
        // 300 = 0b1_0010_1100 -> [0xAC, 0x02]
        let mut bytes = vec![0xAC, 0x02];
        bytes.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        bytes.push(3);
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let mut input = input(&bytes);
        assert_eq!(input.read_vint().unwrap(), 300);
        assert_eq!(input.read_vlong().unwrap(), u64::MAX);
        assert_eq!(input.read_string().unwrap(), "abc");
        assert_eq!(input.read_u32().unwrap(), 42);
    }

    #[test]
    fn test_vint_overflow_is_corruption() {
        let mut input = input(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(input.read_vint(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_clone_of_clone_shares_invalidation() {
        let mut original = input(b"abcdef");
        original.seek(2).unwrap();
        let clone = original.try_clone().unwrap();
        let mut grandchild = clone.try_clone().unwrap();
        assert_eq!(grandchild.read_byte().unwrap(), b'c');

        original.dispose();
        original.dispose();
        assert!(original.is_disposed());
        assert!(matches!(grandchild.read_byte(), Err(Error::AlreadyDisposed)));
        assert!(matches!(clone.position(), Err(Error::AlreadyDisposed)));
        assert!(matches!(original.len(), Err(Error::AlreadyDisposed)));
    }

    #[test]
    fn test_drop_of_original_disposes_clones() {
        let original = input(b"xyz");
        let mut clone = original.try_clone().unwrap();
        drop(original);
        assert!(matches!(clone.read_byte(), Err(Error::AlreadyDisposed)));
    }

    #[test]
    fn test_closed_region_scope_disposes_input() {
        let region = MappedRegion::detached(b"data".to_vec());
        let scope = region.scope().clone();
        let mut input = MappedInput::open(region).unwrap();
        scope.close();
        assert!(matches!(input.read_byte(), Err(Error::AlreadyDisposed)));
        assert!(input.is_disposed());
    }

    #[test]
    fn test_open_on_closed_region_fails() {
        let region = MappedRegion::detached(b"data".to_vec());
        region.scope().close();
        assert!(matches!(
            MappedInput::open(region),
            Err(Error::AlreadyDisposed)
        ));
    }

    #[test]
    fn test_boxed_clone_reads_independently() {
        let mut original = input(b"0123456789");
        original.seek(4).unwrap();
        let mut boxed = original.clone_input().unwrap();
        assert_eq!(boxed.position().unwrap(), 4);
        boxed.skip(3).unwrap();
        assert_eq!(boxed.read_byte().unwrap(), b'7');
        assert_eq!(original.read_byte().unwrap(), b'4');
    }
}
