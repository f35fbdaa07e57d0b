use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};

// =============================================================================
// Raw memory
// =============================================================================

/// Bulk memory source that superblocks are carved from.
///
/// # Safety
///
/// `acquire` must return page-aligned, readable and writable memory of at least `size` bytes
/// that stays valid until passed back to `release` with the same `size`. Implementations must
/// be callable from any thread and must not allocate through the allocator built on top of them.
pub unsafe trait RawMemory: Sync {
  /// Returns `None` when the backend is exhausted.
  fn acquire(&self, size: usize) -> Option<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` and `size` must come from a prior `acquire` and not have been released already.
  unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Anonymous private mappings straight from the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsMemory;

impl OsMemory {
  pub const fn new() -> Self {
    Self
  }
}

unsafe impl RawMemory for OsMemory {
  fn acquire(&self, size: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { os_mmap(size) })
  }

  unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { os_munmap(ptr.as_ptr(), size) };
  }
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

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Threads and processors
// =============================================================================

// Each thread gets a different ID
pub(crate) fn thread_id() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  // TLS is gone during thread teardown; such late calls hash like id 0.
  TID.try_with(|&id| id).unwrap_or(0)
}

pub(crate) fn num_processors() -> usize {
  let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if online < 1 { 1 } else { online as usize }
}

#[inline]
pub(crate) fn yield_now() {
  std::thread::yield_now();
}
