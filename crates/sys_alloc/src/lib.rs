//! Anonymous memory mappings for heap pages.
//!
//! Every page of the heap is backed by one [`Mmap`]. Mappings are zero-filled
//! by the operating system when created, readable and writable, and optionally
//! executable for pages that hold generated code.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity at which the OS hands out fresh mappings.
///
/// On Windows this is the allocation granularity (typically 64KB). On Unix it
/// is the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous mapping.
///
/// The region is unmapped when the handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
    executable: bool,
}

impl Mmap {
    /// Returns a pointer to the first byte of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length requested for the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length. Never the case for a
    /// mapping produced by [`MmapOptions::map_anon`].
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether the mapping was created with execute permission.
    pub const fn is_executable(&self) -> bool {
        self.executable
    }

    /// Returns `true` if `addr` lies inside `[ptr, ptr + len)`.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr - start < self.len()
    }
}

// SAFETY: the mapping is plain memory owned by this handle; access through the
// raw pointer is synchronized by whoever owns the `Mmap`.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Options for creating an anonymous mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    executable: bool,
    populate: bool,
}

impl MmapOptions {
    /// Creates options for a zero-length mapping. A length must be set before
    /// mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            executable: false,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests execute permission in addition to read/write.
    pub const fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    /// Prefaults the page tables (`MAP_POPULATE` on Linux, ignored elsewhere).
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates the mapping.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length, or the OS error if the kernel
    /// refuses the mapping.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be greater than 0",
            ));
        }

        // SAFETY: a fresh anonymous mapping at an OS-chosen address cannot
        // alias any existing Rust allocation.
        let inner = unsafe { os::MmapInner::map_anon(self.len, self.executable, self.populate)? };

        Ok(Mmap {
            inner,
            executable: self.executable,
        })
    }
}
