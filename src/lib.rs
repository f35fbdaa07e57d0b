#![allow(clippy::missing_safety_doc)]

//! A Hoard-style multiprocessor memory allocator.
//!
//! Threads are hashed onto per-processor thread heaps that serve small requests from
//! superblocks. A thread heap whose idle memory grows past a fixed bound hands its emptiest
//! superblock back to a shared process heap, which keeps total memory within a constant factor
//! of the live working set while threads mostly work on their own locks.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr,
};

mod block;
mod config;
mod heap;
mod lock;
mod platform;
mod process_heap;
mod size_class;
mod superblock;
mod thread_heap;

#[cfg(feature = "c_api")]
mod c_api;

pub use config::{
  ALIGNMENT, BLOCK_HEADER_SIZE, MAX_THREAD_HEAPS, NUM_FULLNESS_BINS, PROCESS_REUSABLE_CAP,
  REFILL_COUNT, RELEASE_SLACK_SUPERBLOCKS, SUPERBLOCK_HEADER_SIZE, SUPERBLOCK_SIZE,
  THREAD_REUSABLE_CAP,
};
pub use heap::ClassUsage;
pub use platform::{OsMemory, RawMemory};
pub use process_heap::ProcessHeap;
pub use size_class::{
  MAX_OBJECT_SIZE, SIZE_CLASS_COUNT, blocks_per_superblock, class_size, is_dedicated,
  release_threshold, size_class, superblock_chunk_size,
};

// =============================================================================
// Process-wide instance
// =============================================================================

static PROCESS_HEAP: ProcessHeap = ProcessHeap::new(OsMemory::new());

/// The allocator instance behind [`Allocator`] and the C entry points.
#[inline]
pub fn get_allocator() -> &'static ProcessHeap {
  #[cfg(feature = "c_api")]
  c_api::register_fork_handlers();
  &PROCESS_HEAP
}

pub fn hoard_malloc(size: usize) -> *mut u8 {
  get_allocator().malloc(size)
}

pub unsafe fn hoard_free(ptr: *mut u8) {
  unsafe { get_allocator().free(ptr) }
}

pub fn hoard_calloc(count: usize, size: usize) -> *mut u8 {
  get_allocator().calloc(count, size)
}

pub unsafe fn hoard_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { get_allocator().realloc(ptr, size) }
}

pub fn hoard_memalign(alignment: usize, size: usize) -> *mut u8 {
  get_allocator().memalign(alignment, size)
}

/// Usable bytes at `ptr`; 0 for null.
pub unsafe fn hoard_usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  unsafe { get_allocator().object_size(ptr) }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Plugs the process-wide instance into `#[global_allocator]`.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return hoard_memalign(layout.align(), layout.size());
    }
    hoard_malloc(layout.size())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { hoard_free(ptr) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      let ptr = hoard_memalign(layout.align(), layout.size());
      if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
      }
      return ptr;
    }
    hoard_calloc(1, layout.size())
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return unsafe { hoard_realloc(ptr, new_size) };
    }

    // Over-aligned: in place if the block already covers it, otherwise move.
    if unsafe { get_allocator().resize_in_place(ptr, new_size) } {
      return ptr;
    }
    let new_ptr = hoard_memalign(layout.align(), new_size);
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        hoard_free(ptr);
      }
    }
    new_ptr
  }
}
