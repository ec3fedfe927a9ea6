//! Mapped regions: read-only windows over storage-owned pages
//!
//! A segment blob lives in a `RegionBacking` arena, either owned bytes (in
//! memory environments, freshly written segments) or a memory-mapped file.
//! Transactions hand out `MappedRegion`s that pair the arena with the
//! transaction's `ScopeToken`. Every access goes through the checked
//! accessors below; nobody outside this module sees a raw address.
//!
//! The arena is reference counted, so bytes stay mapped for as long as any
//! region (or reader cloned from one) exists. Validity is a separate, logical
//! concern: once the owning scope closes, every accessor fails with
//! `AlreadyDisposed`.

use memmap2::Mmap;
use quarry_core::{Error, Result, ScopeToken};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Underlying storage for a segment blob.
pub enum RegionBacking {
    /// In-memory owned data
    Owned(Box<[u8]>),
    /// Memory-mapped file data
    Mapped(Mmap),
}

impl RegionBacking {
    /// Map a segment file read-only.
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: segment files are written once (temp + rename) and never
        // modified in place; the mapping is read-only.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(RegionBacking::Mapped(mmap))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            RegionBacking::Owned(v) => v,
            RegionBacking::Mapped(m) => m,
        }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True for an empty blob
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RegionBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionBacking::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
            RegionBacking::Mapped(m) => write!(f, "Mapped({} bytes)", m.len()),
        }
    }
}

/// A `(base, length)` window over a backing arena, valid while its scope is live.
#[derive(Clone)]
pub struct MappedRegion {
    backing: Arc<RegionBacking>,
    base: usize,
    len: usize,
    scope: ScopeToken,
}

impl MappedRegion {
    pub(crate) fn new(backing: Arc<RegionBacking>, scope: ScopeToken) -> Self {
        let len = backing.len();
        Self {
            backing,
            base: 0,
            len,
            scope,
        }
    }

    /// Region over caller-owned bytes with a private scope.
    ///
    /// Close the scope (`region.scope().close()`) to release it.
    pub fn detached(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self::new(
            Arc::new(RegionBacking::Owned(bytes.into_boxed_slice())),
            ScopeToken::new(),
        )
    }

    /// Sub-window `[base, base + len)` sharing this region's scope.
    ///
    /// # Errors
    ///
    /// `InvalidOffset` if the window does not fit inside this region.
    pub fn slice(&self, base: u64, len: u64) -> Result<MappedRegion> {
        self.ensure_live()?;
        let end = base.checked_add(len);
        match end {
            Some(end) if end <= self.len as u64 => Ok(MappedRegion {
                backing: Arc::clone(&self.backing),
                base: self.base + base as usize,
                len: len as usize,
                scope: self.scope.clone(),
            }),
            _ => Err(Error::InvalidOffset {
                offset: i64::try_from(base).unwrap_or(i64::MAX),
                length: self.len as u64,
            }),
        }
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    /// True for a zero-length region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True while the owning scope is live
    #[inline]
    pub fn is_live(&self) -> bool {
        self.scope.is_live()
    }

    /// Fail with `AlreadyDisposed` once the owning scope has closed
    #[inline]
    pub fn ensure_live(&self) -> Result<()> {
        if self.scope.is_live() {
            Ok(())
        } else {
            Err(Error::AlreadyDisposed)
        }
    }

    /// Scope the region is bound to
    pub fn scope(&self) -> &ScopeToken {
        &self.scope
    }

    /// True if the bytes come from a memory-mapped file
    pub fn is_memory_mapped(&self) -> bool {
        matches!(*self.backing, RegionBacking::Mapped(_))
    }

    /// Copy `dst.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// `AlreadyDisposed` after release, `TruncatedRead` if fewer bytes remain.
    #[inline]
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        let available = (self.len as u64).saturating_sub(offset);
        if (dst.len() as u64) > available {
            return Err(Error::TruncatedRead {
                requested: dst.len(),
                available,
            });
        }
        let start = self.base + offset as usize;
        dst.copy_from_slice(&self.backing.as_bytes()[start..start + dst.len()]);
        Ok(())
    }

    /// Byte at `offset`.
    ///
    /// # Errors
    ///
    /// `AlreadyDisposed` after release, `EndOfInput` at or past the end.
    #[inline]
    pub fn byte_at(&self, offset: u64) -> Result<u8> {
        self.ensure_live()?;
        if offset >= self.len as u64 {
            return Err(Error::EndOfInput { position: offset });
        }
        Ok(self.backing.as_bytes()[self.base + offset as usize])
    }

    /// Run `f` over the whole window without copying.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.ensure_live()?;
        Ok(f(&self.backing.as_bytes()[self.base..self.base + self.len]))
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("live", &self.is_live())
            .field("mapped", &self.is_memory_mapped())
            .finish()
    }
}
