//! Arena providers: where block extents come from.
//!
//! A provider hands out page-granularity extents that are already
//! [`ALIGNMENT`](crate::ALIGNMENT) aligned, and takes them back once the
//! block living in them has been removed from its set.

use core::ptr::{NonNull, null_mut};
use std::io;

use crate::error::ArenaError;

/// A contiguous address range `[start, start + len)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Extent {
    start: NonNull<u8>,
    len: usize,
}

impl Extent {
    #[inline]
    pub const fn new(start: NonNull<u8>, len: usize) -> Self {
        Self { start, len }
    }

    #[inline]
    pub const fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.len)
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        addr >= self.start.as_ptr().addr() && addr < self.end().addr()
    }
}

/// Source of raw memory for blocks.
pub trait ArenaProvider {
    /// Returns an extent of at least `min_size` bytes, `size_hint` if convenient.
    fn allocate_extent(&mut self, min_size: usize, size_hint: usize) -> Result<Extent, ArenaError>;

    /// Gives `extent` back.
    ///
    /// # Safety
    /// `extent` must have come from this provider and nothing may touch it afterwards.
    unsafe fn release_extent(&mut self, extent: Extent);
}

// =============================================================================
// Platform
// =============================================================================

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED { null_mut() } else { ptr.cast() }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) -> io::Result<()> {
    if unsafe { libc::munmap(ptr.cast(), size) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

// =============================================================================
// mmap arena
// =============================================================================

/// Anonymous private mappings, one per extent.
#[derive(Debug)]
pub struct MmapArena {
    page_size: usize,
    mapped_bytes: usize,
    mapped_extents: usize,
}

impl MmapArena {
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
            mapped_bytes: 0,
            mapped_extents: 0,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes currently mapped and not yet released.
    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    #[inline]
    pub fn mapped_extents(&self) -> usize {
        self.mapped_extents
    }
}

impl Default for MmapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaProvider for MmapArena {
    fn allocate_extent(&mut self, min_size: usize, size_hint: usize) -> Result<Extent, ArenaError> {
        let wanted = min_size.max(size_hint);
        if wanted == 0 {
            return Err(ArenaError::ZeroSize);
        }
        let size = wanted
            .checked_next_multiple_of(self.page_size)
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or(ArenaError::TooLarge { size: wanted })?;

        let ptr = unsafe { os_mmap(size) };
        let Some(start) = NonNull::new(ptr) else {
            return Err(ArenaError::MapFailed { size, source: io::Error::last_os_error() });
        };
        self.mapped_bytes += size;
        self.mapped_extents += 1;
        log::debug!("mapped extent {:p} ({size} bytes, {} outstanding)", start, self.mapped_bytes);
        Ok(Extent::new(start, size))
    }

    unsafe fn release_extent(&mut self, extent: Extent) {
        match unsafe { os_munmap(extent.start().as_ptr(), extent.len()) } {
            Ok(()) => {
                self.mapped_bytes -= extent.len();
                self.mapped_extents -= 1;
                log::debug!("unmapped extent {:p} ({} bytes)", extent.start(), extent.len());
            }
            Err(err) => log::warn!("munmap of {:p} ({} bytes) failed: {err}", extent.start(), extent.len()),
        }
    }
}
