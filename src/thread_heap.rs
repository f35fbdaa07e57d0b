use core::ptr::null_mut;

use crate::{
  block::Block,
  config::{ALIGNMENT, BLOCK_HEADER_SIZE, align_up},
  heap::{Heap, HeapKind},
  platform::RawMemory,
  process_heap::ProcessHeap,
  size_class::{class_size, size_class},
};

/// Per-thread front end. Threads are hashed onto these, so a slot may be shared; its lock keeps
/// that correct.
pub(crate) struct ThreadHeap {
  heap: Heap,
}

impl ThreadHeap {
  pub(crate) const fn new() -> Self {
    Self {
      heap: Heap::new(HeapKind::Thread),
    }
  }

  #[inline]
  pub(crate) fn heap(&self) -> &Heap {
    &self.heap
  }

  pub(crate) fn malloc<M: RawMemory>(&self, size: usize, process: &ProcessHeap<M>) -> *mut u8 {
    let Some(class) = size_class(size) else {
      return null_mut();
    };

    self.heap.lock();
    let mut block = unsafe { self.heap.find_available_superblock(class) };
    if block.is_null() {
      let mut sb = process.acquire(class, &self.heap);
      if sb.is_null() {
        sb = process.new_superblock(class, &self.heap);
      }
      if sb.is_null() {
        self.heap.unlock();
        return null_mut();
      }
      // An empty superblock lands on the reusable stack; the retry picks it up from there.
      unsafe {
        self.heap.insert_superblock(class, sb);
        block = self.heap.find_available_superblock(class);
      }
      debug_assert!(!block.is_null(), "malloc: fresh superblock {:p} yielded no block", sb);
    }
    unsafe { (*block).mark_allocated(size) };
    self.heap.unlock();

    Block::user_ptr(block)
  }

  /// Over-allocates by `alignment` plus one header, then plants a forwarding header right
  /// before the first suitably aligned address.
  pub(crate) fn memalign<M: RawMemory>(
    &self,
    alignment: usize,
    size: usize,
    process: &ProcessHeap<M>,
  ) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    if alignment <= ALIGNMENT {
      return self.malloc(size, process);
    }

    let Some(padded) = size
      .checked_add(alignment)
      .and_then(|n| n.checked_add(BLOCK_HEADER_SIZE))
    else {
      return null_mut();
    };

    let ptr = self.malloc(padded, process);
    if ptr.is_null() {
      return ptr;
    }

    let block = unsafe { Block::from_user_ptr(ptr) };
    unsafe { (*block).mark_allocated(size) };

    let offset = align_up(ptr as usize, alignment) - ptr as usize;
    if offset == 0 {
      return ptr;
    }
    let aligned = unsafe { ptr.add(offset) };
    unsafe { Block::write_forward(aligned, block) };
    aligned
  }

  /// Usable bytes behind `ptr`: the class size, minus the alignment offset for `memalign`
  /// pointers.
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this allocator.
  pub(crate) unsafe fn object_size(ptr: *mut u8) -> usize {
    unsafe {
      let block = Block::from_user_ptr(ptr);
      let sb = (*block).superblock();
      let offset = ptr as usize - Block::user_ptr(block) as usize;
      class_size((*sb).size_class()) - offset
    }
  }
}
