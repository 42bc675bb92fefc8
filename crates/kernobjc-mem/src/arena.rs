//! Bump-pointer arena for runtime metadata.
//!
//! Runtime metadata (class records, method records, selector names and type
//! signatures) is written once and read for as long as its owner lives. The
//! [`MetadataArena`] hands out stable pointers from large chunks with an
//! atomic bump pointer, so concurrent allocation needs no lock on the fast
//! path.
//!
//! Two flavours are used by the runtime:
//!
//! - [`metadata_arena`]: the process-wide arena for classes and methods. It is
//!   never dropped, so its allocations are `'static`.
//! - A limited arena created with [`MetadataArena::with_limit`]: used by a
//!   selector table for its strings. Once `max_chunks` chunks are in use,
//!   [`MetadataArena::try_alloc`] reports [`ArenaAllocError::LimitReached`]
//!   instead of growing. Dropping the arena frees every chunk.
//!
//! # Example
//!
//! ```
//! use kernobjc_mem::arena::MetadataArena;
//!
//! let arena = MetadataArena::new(16 * 1024);
//!
//! let value = arena.alloc(42u32);
//! let name = arena.alloc_str("retain");
//!
//! assert_eq!(*value, 42);
//! assert_eq!(name, "retain");
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Error type for arena allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaAllocError {
    /// The system allocator refused a new chunk.
    OutOfMemory {
        /// Requested chunk size in bytes.
        size: usize,
    },
    /// The arena already holds its maximum number of chunks.
    LimitReached {
        /// The configured chunk limit.
        max_chunks: usize,
    },
    /// The requested layout cannot be represented.
    InvalidLayout,
}

impl fmt::Display for ArenaAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaAllocError::OutOfMemory { size } => {
                write!(f, "Arena allocation failed: no memory for a {size} byte chunk")
            }
            ArenaAllocError::LimitReached { max_chunks } => {
                write!(f, "Arena allocation failed: limit of {max_chunks} chunks reached")
            }
            ArenaAllocError::InvalidLayout => {
                write!(f, "Arena allocation failed: invalid layout")
            }
        }
    }
}

impl std::error::Error for ArenaAllocError {}

/// Alignment of every chunk and minimum alignment of every allocation.
const DEFAULT_ALIGNMENT: usize = 8;

/// Minimum chunk size (4 KiB, one page).
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Maximum size a chunk grows to (1 MiB).
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size of the process-wide metadata arena.
const GLOBAL_CHUNK_SIZE: usize = 64 * 1024;

/// Arena allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total number of bytes handed out across all chunks.
    pub total_allocated: usize,
    /// Number of chunks in the arena.
    pub chunk_count: usize,
    /// Total capacity of all chunks in bytes.
    pub total_capacity: usize,
}

/// A fixed-size memory chunk with an atomic bump pointer.
///
/// # Safety
///
/// - Chunk memory is only released when the owning arena is dropped
/// - All allocations are aligned to the requested power-of-two alignment
/// - The bump pointer only moves forward
struct Chunk {
    start: NonNull<u8>,
    ptr: AtomicPtr<u8>,
    end: usize,
    capacity: usize,
}

impl Chunk {
    /// Allocates a chunk of `size` bytes and returns an owning raw pointer.
    fn new(size: usize) -> Result<NonNull<Chunk>, ArenaAllocError> {
        let layout = Layout::from_size_align(size, DEFAULT_ALIGNMENT)
            .map_err(|_| ArenaAllocError::InvalidLayout)?;

        // SAFETY: size is at least MIN_CHUNK_SIZE, so the layout is non-zero.
        let start = unsafe { alloc::alloc(layout) };
        let start =
            NonNull::new(start).ok_or(ArenaAllocError::OutOfMemory { size })?;

        let chunk = Box::new(Chunk {
            start,
            ptr: AtomicPtr::new(start.as_ptr()),
            end: start.addr().get() + size,
            capacity: size,
        });

        // SAFETY: Box::into_raw never returns null.
        Ok(unsafe { NonNull::new_unchecked(Box::into_raw(chunk)) })
    }

    /// Bumps the pointer by `size` bytes at `align`, or returns `None` if the
    /// chunk is full.
    #[inline(always)]
    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        loop {
            let current = self.ptr.load(Ordering::Acquire);
            let aligned_start = current.addr().checked_add(align - 1)? & !(align - 1);
            let new_addr = aligned_start.checked_add(size)?;

            if new_addr > self.end {
                return None;
            }

            // with_addr keeps the provenance of the chunk allocation.
            let new_ptr = current.with_addr(new_addr);

            if self
                .ptr
                .compare_exchange_weak(current, new_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let result = current.with_addr(aligned_start);
                // SAFETY: aligned_start lies inside the chunk, so it is non-null.
                return Some(unsafe { NonNull::new_unchecked(result) });
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: the same layout was used in Chunk::new.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.capacity, DEFAULT_ALIGNMENT);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}

/// Thread-safe bump arena for write-once metadata.
///
/// Values placed in the arena are never dropped; only the backing memory is
/// released when the arena itself is dropped. Store only plain data or types
/// whose destructors need not run.
///
/// # Thread Safety
///
/// Allocation is lock-free while the current chunk has room. Growing takes a
/// mutex on the chunk list.
pub struct MetadataArena {
    chunks: Mutex<Vec<NonNull<Chunk>>>,
    current_chunk: AtomicPtr<Chunk>,
    chunk_size: usize,
    max_chunks: Option<usize>,
    total_allocated: AtomicUsize,
}

// SAFETY: chunks are only reached through atomics or the chunk-list mutex,
// and the bump pointer is updated with CAS.
unsafe impl Send for MetadataArena {}
// SAFETY: see above.
unsafe impl Sync for MetadataArena {}

impl MetadataArena {
    /// Creates an unbounded arena. `chunk_size` is raised to at least
    /// [`MIN_CHUNK_SIZE`] and rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if the first chunk cannot be allocated.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self::build(chunk_size, None)
            .unwrap_or_else(|err| panic!("metadata arena: {err}"))
    }

    /// Creates an arena that never holds more than `max_chunks` chunks.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaAllocError::LimitReached`] if `max_chunks` is zero, or
    /// [`ArenaAllocError::OutOfMemory`] if the first chunk cannot be allocated.
    pub fn with_limit(chunk_size: usize, max_chunks: usize) -> Result<Self, ArenaAllocError> {
        if max_chunks == 0 {
            return Err(ArenaAllocError::LimitReached { max_chunks });
        }
        Self::build(chunk_size, Some(max_chunks))
    }

    fn build(chunk_size: usize, max_chunks: Option<usize>) -> Result<Self, ArenaAllocError> {
        let size = chunk_size.max(MIN_CHUNK_SIZE).next_power_of_two();
        let first = Chunk::new(size)?;

        Ok(MetadataArena {
            chunks: Mutex::new(vec![first]),
            current_chunk: AtomicPtr::new(first.as_ptr()),
            chunk_size: size,
            max_chunks,
            total_allocated: AtomicUsize::new(0),
        })
    }

    /// Allocates `value` in the arena.
    ///
    /// # Panics
    ///
    /// Panics if the allocation fails. Limited arenas should use
    /// [`try_alloc`](Self::try_alloc).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        match self.try_alloc(value) {
            Ok(slot) => slot,
            Err(err) => panic!("metadata arena: {err}"),
        }
    }

    /// Allocates `value` in the arena, reporting exhaustion as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a new chunk is needed and cannot be created.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc<T>(&self, value: T) -> Result<&mut T, ArenaAllocError> {
        let layout = Layout::new::<T>();
        let ptr = self.alloc_layout(layout)?.cast::<T>();
        // SAFETY: ptr is fresh, suitably aligned and sized for T, and never
        // handed out twice.
        unsafe {
            ptr.as_ptr().write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    /// Copies `s` into the arena.
    ///
    /// # Panics
    ///
    /// Panics if the allocation fails.
    pub fn alloc_str(&self, s: &str) -> &str {
        match self.try_alloc_str(s) {
            Ok(copy) => copy,
            Err(err) => panic!("metadata arena: {err}"),
        }
    }

    /// Copies `s` into the arena, reporting exhaustion as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a new chunk is needed and cannot be created.
    pub fn try_alloc_str(&self, s: &str) -> Result<&str, ArenaAllocError> {
        if s.is_empty() {
            return Ok("");
        }
        let layout = Layout::from_size_align(s.len(), 1)
            .map_err(|_| ArenaAllocError::InvalidLayout)?;
        let ptr = self.alloc_layout(layout)?;
        // SAFETY: ptr points to s.len() fresh bytes; the copy is valid UTF-8.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), s.len());
            Ok(std::str::from_utf8_unchecked(bytes))
        }
    }

    fn alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>, ArenaAllocError> {
        let size = layout.size().max(1);
        let align = layout.align().max(DEFAULT_ALIGNMENT);

        loop {
            let current = self.current_chunk.load(Ordering::Acquire);
            // SAFETY: current_chunk always points at a live chunk owned by self.
            let chunk = unsafe { &*current };

            if let Some(ptr) = chunk.try_alloc(size, align) {
                self.total_allocated.fetch_add(size, Ordering::Relaxed);
                return Ok(ptr);
            }

            self.allocate_new_chunk(current, size + align)?;
        }
    }

    #[cold]
    fn allocate_new_chunk(&self, seen: *mut Chunk, min_size: usize) -> Result<(), ArenaAllocError> {
        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());

        // Another thread grew the arena while we waited.
        if self.current_chunk.load(Ordering::Acquire) != seen {
            return Ok(());
        }

        if let Some(max_chunks) = self.max_chunks {
            if chunks.len() >= max_chunks {
                return Err(ArenaAllocError::LimitReached { max_chunks });
            }
        }

        let grown = if self.max_chunks.is_some() {
            self.chunk_size
        } else {
            (self.chunk_size << chunks.len().min(8)).min(MAX_CHUNK_SIZE)
        };
        let new_chunk = Chunk::new(grown.max(min_size.next_power_of_two()))?;

        chunks.push(new_chunk);
        self.current_chunk.store(new_chunk.as_ptr(), Ordering::Release);
        Ok(())
    }

    /// Returns allocation statistics for this arena.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        let total_capacity = chunks
            .iter()
            // SAFETY: every pointer in the list is a live chunk.
            .map(|c| unsafe { c.as_ref() }.capacity)
            .sum();

        ArenaStats {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            chunk_count: chunks.len(),
            total_capacity,
        }
    }

    /// The chunk limit, if any.
    #[must_use]
    pub fn max_chunks(&self) -> Option<usize> {
        self.max_chunks
    }
}

impl Drop for MetadataArena {
    fn drop(&mut self) {
        let chunks = self.chunks.get_mut().unwrap_or_else(|e| e.into_inner());
        for chunk in chunks.drain(..) {
            // SAFETY: each chunk came from Box::into_raw in Chunk::new and is
            // dropped exactly once here.
            drop(unsafe { Box::from_raw(chunk.as_ptr()) });
        }
    }
}

/// The process-wide metadata arena.
///
/// Classes, metaclasses, methods and ivars live here. The arena is never
/// dropped, so everything allocated in it stays valid for the rest of the
/// process.
///
/// ```
/// use kernobjc_mem::arena::metadata_arena;
///
/// let name: &'static str = metadata_arena().alloc_str("NSObject");
/// assert_eq!(name, "NSObject");
/// ```
#[must_use]
pub fn metadata_arena() -> &'static MetadataArena {
    static ARENA: OnceLock<MetadataArena> = OnceLock::new();
    ARENA.get_or_init(|| MetadataArena::new(GLOBAL_CHUNK_SIZE))
}
