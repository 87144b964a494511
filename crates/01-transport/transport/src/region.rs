//! Memory backing for the framed rings.
//!
//! A ring is a fixed-size region shared between writers and one reader, which
//! may live in another process. This module offers a single abstraction over
//! three backings: anonymous `mmap` (page aligned), heap allocations honouring
//! an explicit alignment, and file-backed shared mappings used when the media
//! driver runs out of process. The unsafe surface stays inside this file.

use crate::{TransportError, TransportResult};
use memmap2::{MmapMut, MmapOptions};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

#[derive(Debug)]
enum Backing {
    Anonymous(MmapMut),
    File { map: MmapMut, path: PathBuf },
    Owned { ptr: NonNull<u8>, layout: Layout },
}

impl Backing {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::Anonymous(map) | Backing::File { map, .. } => map.as_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Backing memory for framed rings.
///
/// Native targets prefer anonymous `mmap` regions. When the mapping is not
/// suitably aligned we fall back to heap allocations. File-backed regions are
/// created through [`SharedRegion::create_file`] / [`SharedRegion::map_existing`]
/// and are visible to every process mapping the same file.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    backing: Backing,
}

// SAFETY: the region owns its allocation/mapping for its whole lifetime and never
// hands out references; concurrent access goes through raw pointers whose
// synchronisation is the responsibility of the ring protocol built on top.
unsafe impl Send for SharedRegion {}
// SAFETY: see above; `&SharedRegion` only exposes addresses and lengths.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new process-local region of `len` bytes aligned to `alignment`.
    ///
    /// We first try to satisfy the request via anonymous `mmap`. If the
    /// returned pointer is not suitably aligned, we transparently fall back to
    /// the heap implementation.
    pub fn new_aligned(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        if let Some(backing) = Self::mmap_backed(len, alignment, init)? {
            return Ok(Self {
                len,
                alignment,
                backing,
            });
        }

        Self::heap_backed(len, alignment, init)
    }

    /// Creates (or truncates) `path`, sizes it to `len` zeroed bytes, and maps it shared.
    pub fn create_file(path: impl AsRef<Path>, len: usize) -> TransportResult<Self> {
        let path = path.as_ref();
        let mapping_failed = |source| TransportError::MappingFailed {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(mapping_failed)?;
        file.set_len(len as u64).map_err(mapping_failed)?;

        // SAFETY: the file was just sized by us; other processes are expected to
        // coordinate through the ring protocol rather than resizing the file.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(mapping_failed)?;
        Ok(Self::from_file_map(map, path))
    }

    /// Maps an existing file in full, shared and writable.
    pub fn map_existing(path: impl AsRef<Path>) -> TransportResult<Self> {
        let path = path.as_ref();
        let mapping_failed = |source| TransportError::MappingFailed {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(mapping_failed)?;
        // SAFETY: as in `create_file`, the length is fixed for the lifetime of the mapping.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(mapping_failed)?;
        Ok(Self::from_file_map(map, path))
    }

    fn from_file_map(map: MmapMut, path: &Path) -> Self {
        Self {
            len: map.len(),
            alignment: page_size_hint(),
            backing: Backing::File {
                map,
                path: path.to_path_buf(),
            },
        }
    }

    fn heap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        let ptr = unsafe {
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            backing: Backing::Owned { ptr, layout },
        })
    }

    fn mmap_backed(
        len: usize,
        alignment: usize,
        init: RegionInit,
    ) -> Result<Option<Backing>, TransportError> {
        let mut map = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            unsafe {
                // SAFETY: the anonymous mapping exposes `len` bytes that can be zeroed here.
                ptr::write_bytes(ptr, 0, len)
            };
        }

        Ok(Some(Backing::Anonymous(map)))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Path of the backing file, if the region is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Base address of the region.
    ///
    /// The pointer may be written through by several threads at once; callers
    /// must partition the bytes they touch and publish them with atomics.
    pub fn as_shared_ptr(&self) -> *mut u8 {
        self.backing.as_ptr() as *mut u8
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}

fn page_size_hint() -> usize {
    4096
}
