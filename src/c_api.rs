//! C entry points, exported unmangled so the library can stand in for the system `malloc`.

use core::{
  ffi::c_int,
  mem::size_of,
  ptr::null_mut,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{
  PROCESS_HEAP, config::PAGE_SIZE, hoard_calloc, hoard_free, hoard_malloc, hoard_memalign,
  hoard_realloc, hoard_usable_size,
};

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  or_enomem(hoard_malloc(size))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { hoard_free(ptr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  or_enomem(hoard_calloc(nmemb, size))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let new_ptr = unsafe { hoard_realloc(ptr, size) };
  // A null result for a non-null pointer and zero size means "freed", not a failure.
  if size == 0 && !ptr.is_null() {
    return new_ptr;
  }
  or_enomem(new_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  aligned(alignment, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  aligned(alignment, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
  aligned(PAGE_SIZE, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> c_int {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = hoard_memalign(alignment, size);
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { hoard_usable_size(ptr) }
}

fn aligned(alignment: usize, size: usize) -> *mut u8 {
  if !alignment.is_power_of_two() {
    set_errno(libc::EINVAL);
    return null_mut();
  }
  or_enomem(hoard_memalign(alignment, size))
}

/// Passes `ptr` through, setting `errno` to `ENOMEM` when it is null.
#[inline]
fn or_enomem(ptr: *mut u8) -> *mut u8 {
  if ptr.is_null() {
    set_errno(libc::ENOMEM);
  }
  ptr
}

fn set_errno(code: c_int) {
  unsafe { *libc::__errno_location() = code };
}

// =============================================================================
// Fork
// =============================================================================

static FORK_HANDLERS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Installs the `pthread_atfork` handlers on first use. `pthread_atfork` may itself call
/// `malloc`, which re-enters here and finds the flag already set.
#[inline]
pub(crate) fn register_fork_handlers() {
  if FORK_HANDLERS_REGISTERED.load(Ordering::Relaxed) {
    return;
  }
  if !FORK_HANDLERS_REGISTERED.swap(true, Ordering::AcqRel) {
    unsafe { libc::pthread_atfork(Some(before_fork), Some(after_fork_parent), Some(after_fork_child)) };
  }
}

unsafe extern "C" fn before_fork() {
  PROCESS_HEAP.lock_all();
}

unsafe extern "C" fn after_fork_parent() {
  PROCESS_HEAP.unlock_all();
}

unsafe extern "C" fn after_fork_child() {
  unsafe { PROCESS_HEAP.reset_locks() };
}
