//! The process heap: back end of every thread heap and the public allocation surface.
//!
//! It owns the array of thread heaps, arbitrates superblocks they give up, hands out fresh
//! superblocks carved from bulk refills, and routes `free` to whichever heap currently owns the
//! superblock of a block.
//!
//! Lock order, outermost first: superblock up-lock, thread heap, process heap, refill buffer.

use core::{
  cell::UnsafeCell,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
  block::Block,
  config::{MAX_THREAD_HEAPS, REFILL_COUNT, SUPERBLOCK_SIZE},
  heap::{ClassUsage, FreeOutcome, Heap, HeapKind},
  lock::SpinLock,
  platform::{self, OsMemory, RawMemory},
  size_class::{is_dedicated, superblock_chunk_size},
  superblock::Superblock,
  thread_heap::ThreadHeap,
};

/// Odd, so distinct thread ids stay distinct modulo any power of two.
const THREAD_HASH_MULTIPLIER: u32 = 0x9E37_79B1;

// =============================================================================
// Topology
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Topology {
  heap_mask: usize,
  multiprocessor: bool,
}

impl Topology {
  /// Twice as many thread heaps as processors, rounded up to a power of two.
  fn for_processors(processors: usize) -> Self {
    let processors = processors.max(1);
    let heaps = processors
      .saturating_mul(2)
      .next_power_of_two()
      .min(MAX_THREAD_HEAPS);
    Self {
      heap_mask: heaps - 1,
      multiprocessor: processors > 1,
    }
  }

  // 0 is reserved for "not decided yet".
  fn encode(self) -> usize {
    ((self.heap_mask + 1) << 1) | self.multiprocessor as usize
  }

  fn decode(raw: usize) -> Self {
    Self {
      heap_mask: (raw >> 1) - 1,
      multiprocessor: raw & 1 == 1,
    }
  }
}

// =============================================================================
// Superblock buffer
// =============================================================================

struct RefillBuffer {
  cursor: *mut u8,
  remaining: usize,
}

// =============================================================================
// Process heap
// =============================================================================

/// A complete allocator instance: one process heap plus its thread heaps.
///
/// Superblocks remember their owning heap by address, so an instance must stay put once it has
/// served an allocation. The allocating entry points therefore take `&'static self`; use a
/// `static` (see [`crate::get_allocator`]) or a leaked box.
pub struct ProcessHeap<M: RawMemory = OsMemory> {
  heap: Heap,
  thread_heaps: [ThreadHeap; MAX_THREAD_HEAPS],
  topology: AtomicUsize,
  buffer_lock: SpinLock,
  buffer: UnsafeCell<RefillBuffer>,
  superblocks_created: AtomicUsize,
  memory: M,
}

unsafe impl<M: RawMemory> Sync for ProcessHeap<M> {}
unsafe impl<M: RawMemory + Send> Send for ProcessHeap<M> {}

impl<M: RawMemory> ProcessHeap<M> {
  pub const fn new(memory: M) -> Self {
    Self {
      heap: Heap::new(HeapKind::Process),
      thread_heaps: [const { ThreadHeap::new() }; MAX_THREAD_HEAPS],
      topology: AtomicUsize::new(0),
      buffer_lock: SpinLock::new(),
      buffer: UnsafeCell::new(RefillBuffer {
        cursor: null_mut(),
        remaining: 0,
      }),
      superblocks_created: AtomicUsize::new(0),
      memory,
    }
  }

  /// Sizes the thread heap array for `processors` processors. Only effective before the first
  /// allocation; returns `false` if the layout was already fixed.
  pub fn configure(&self, processors: usize) -> bool {
    let wanted = Topology::for_processors(processors).encode();
    self
      .topology
      .compare_exchange(0, wanted, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn topology(&self) -> Topology {
    let raw = self.topology.load(Ordering::Acquire);
    if raw != 0 {
      return Topology::decode(raw);
    }
    let detected = Topology::for_processors(platform::num_processors()).encode();
    match self
      .topology
      .compare_exchange(0, detected, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => Topology::decode(detected),
      Err(current) => Topology::decode(current),
    }
  }

  /// Number of thread heaps in use. Heap indices run from 1 to this value; 0 is the process heap.
  pub fn thread_heap_count(&self) -> usize {
    self.topology().heap_mask + 1
  }

  #[inline]
  pub(crate) fn is_multiprocessor(&self) -> bool {
    self.topology().multiprocessor
  }

  /// Thread heap slot of the calling thread.
  #[inline]
  pub fn current_heap_index(&self) -> usize {
    let hashed = platform::thread_id().wrapping_mul(THREAD_HASH_MULTIPLIER) as usize;
    1 + (hashed & self.topology().heap_mask)
  }

  #[inline]
  fn current_thread_heap(&self) -> &ThreadHeap {
    &self.thread_heaps[self.current_heap_index() - 1]
  }

  fn heap_at(&self, index: usize) -> &Heap {
    if index == 0 {
      &self.heap
    } else {
      self.thread_heaps[index - 1].heap()
    }
  }

  /// The raw memory backend.
  pub fn memory(&self) -> &M {
    &self.memory
  }

  // ===========================================================================
  // Allocation surface
  // ===========================================================================

  /// Uninitialized memory for `size` bytes, aligned to [`crate::ALIGNMENT`]. Null when the
  /// backend is exhausted or `size` exceeds [`crate::MAX_OBJECT_SIZE`].
  pub fn malloc(&'static self, size: usize) -> *mut u8 {
    self.current_thread_heap().malloc(size, self)
  }

  /// Zeroed memory for `count` elements of `size` bytes. Null on overflow or exhaustion.
  pub fn calloc(&'static self, count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      return null_mut();
    };
    let ptr = self.malloc(total);
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
  }

  /// Memory aligned to `alignment`, which must be a power of two (null otherwise).
  pub fn memalign(&'static self, alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
      return null_mut();
    }
    self.current_thread_heap().memalign(alignment, size, self)
  }

  /// Returns `ptr` to whichever heap currently owns its superblock.
  ///
  /// # Safety
  ///
  /// `ptr` is null or a live pointer from this instance. Anything else is undefined behavior.
  pub unsafe fn free(&'static self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }

    let block = unsafe { Block::from_user_ptr(ptr) };
    unsafe { check_live(block, "free") };
    let sb = unsafe { (*block).superblock() };
    debug_assert!(unsafe { (*sb).is_valid() }, "free: {:p} has no valid superblock", ptr);

    // Pin the superblock, then chase its owner until the owner we locked is still the owner.
    // Owners only change under the owner's lock, so once locked it cannot move away.
    unsafe { (*sb).up_lock() };
    let owner = loop {
      let owner = unsafe { (*sb).owner() };
      unsafe { (*owner).lock() };
      if ptr::eq(owner, unsafe { (*sb).owner() }) {
        break owner;
      }
      unsafe { (*owner).unlock() };
      platform::yield_now();
    };

    let outcome = unsafe { (*owner).free_block(block, sb, self) };
    unsafe { (*owner).unlock() };

    if outcome == FreeOutcome::Kept {
      unsafe { (*sb).up_unlock() };
    }
  }

  /// C `realloc` semantics. Never shrinks in place: a pointer whose block already covers
  /// `size` comes back unchanged.
  ///
  /// # Safety
  ///
  /// Same as [`ProcessHeap::free`].
  pub unsafe fn realloc(&'static self, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.malloc(size);
    }
    if size == 0 {
      unsafe { self.free(ptr) };
      return null_mut();
    }

    if unsafe { self.resize_in_place(ptr, size) } {
      return ptr;
    }

    let old_size = unsafe { self.object_size(ptr) };
    let new_ptr = self.malloc(size);
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size));
        self.free(ptr);
      }
    }
    new_ptr
  }

  /// Re-tags `ptr` with `size` if its block already covers that many bytes. Returns whether it
  /// did; on `false` nothing changed.
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this instance.
  pub unsafe fn resize_in_place(&self, ptr: *mut u8, size: usize) -> bool {
    if unsafe { self.object_size(ptr) } < size {
      return false;
    }
    unsafe { (*Block::from_user_ptr(ptr)).mark_allocated(size) };
    true
  }

  /// Bytes usable at `ptr`, which is at least what was requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this instance.
  pub unsafe fn object_size(&self, ptr: *mut u8) -> usize {
    unsafe { check_live(Block::from_user_ptr(ptr), "object_size") };
    unsafe { ThreadHeap::object_size(ptr) }
  }

  /// Bytes originally asked for when `ptr` was allocated (or last resized in place).
  ///
  /// # Safety
  ///
  /// `ptr` must be live and come from this instance.
  pub unsafe fn requested_size(&self, ptr: *mut u8) -> usize {
    let block = unsafe { Block::from_user_ptr(ptr) };
    unsafe { check_live(block, "requested_size") };
    unsafe { (*block).requested_size() }
  }

  // ===========================================================================
  // Superblock traffic
  // ===========================================================================

  /// Hands the emptiest superblock of `class` over to `dest`. Null if there is none.
  ///
  /// The caller holds the lock of `dest`.
  pub(crate) fn acquire(&self, class: usize, dest: &Heap) -> *mut Superblock {
    self.heap.lock();
    let sb = unsafe { self.heap.remove_max_superblock(class) };
    if !sb.is_null() {
      unsafe { (*sb).set_owner(dest) };
    }
    self.heap.unlock();
    sb
  }

  /// Takes back a superblock a thread heap has given up.
  ///
  /// # Safety
  ///
  /// The caller holds the lock of the current owner, from whose lists `sb` has been removed.
  pub(crate) unsafe fn release(&self, sb: *mut Superblock) {
    debug_assert!(unsafe { (*sb).available() } > 0, "release: superblock {:p} is full", sb);
    self.heap.lock();
    unsafe {
      (*sb).set_owner(&self.heap);
      self.heap.insert_superblock((*sb).size_class(), sb);
    }
    self.heap.unlock();
  }

  /// Formats fresh raw memory as an empty superblock of `class` owned by `owner`.
  pub(crate) fn new_superblock(&self, class: usize, owner: &Heap) -> *mut Superblock {
    let chunk_size = superblock_chunk_size(class);
    let chunk = if is_dedicated(class) {
      self.memory.acquire(chunk_size)
    } else {
      self.get_superblock_buffer()
    };
    let Some(chunk) = chunk else {
      return null_mut();
    };

    self.superblocks_created.fetch_add(1, Ordering::Relaxed);
    unsafe { Superblock::construct(chunk, chunk_size, class, owner) }
  }

  /// Next standard chunk from the refill buffer, refilling `REFILL_COUNT` chunks at a time.
  fn get_superblock_buffer(&self) -> Option<NonNull<u8>> {
    self.buffer_lock.lock();
    let buffer = unsafe { &mut *self.buffer.get() };

    if buffer.remaining == 0 {
      if let Some(bulk) = self.memory.acquire(REFILL_COUNT * SUPERBLOCK_SIZE) {
        buffer.cursor = bulk.as_ptr();
        buffer.remaining = REFILL_COUNT;
      } else {
        // Memory is tight; a single chunk may still fit.
        self.buffer_lock.unlock();
        return self.memory.acquire(SUPERBLOCK_SIZE);
      }
    }

    let chunk = buffer.cursor;
    buffer.cursor = chunk.wrapping_add(SUPERBLOCK_SIZE);
    buffer.remaining -= 1;
    self.buffer_lock.unlock();
    NonNull::new(chunk)
  }

  /// Returns a single-block superblock's dedicated chunk to the backend.
  ///
  /// # Safety
  ///
  /// `sb` is on no list and nothing references it anymore.
  pub(crate) unsafe fn destroy_superblock(&self, sb: *mut Superblock) {
    unsafe {
      let size = (*sb).chunk_size();
      debug_assert!(
        is_dedicated((*sb).size_class()),
        "destroy_superblock: {:p} is a slice of a refill",
        sb
      );
      self.memory.release(NonNull::new_unchecked(sb as *mut u8), size);
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Block counters of `class` in heap `heap_index` (0 is the process heap).
  ///
  /// # Panics
  ///
  /// If `heap_index > MAX_THREAD_HEAPS` or `class >= SIZE_CLASS_COUNT`.
  pub fn usage(&self, heap_index: usize, class: usize) -> ClassUsage {
    self.heap_at(heap_index).usage(class)
  }

  /// Empty superblocks parked for reformatting in heap `heap_index`.
  pub fn reusable_superblocks(&self, heap_index: usize) -> usize {
    self.heap_at(heap_index).reusable_count()
  }

  /// Superblocks formatted from fresh raw memory so far.
  pub fn superblocks_created(&self) -> usize {
    self.superblocks_created.load(Ordering::Relaxed)
  }

  // ===========================================================================
  // Fork support
  // ===========================================================================

  /// Takes every heap lock in lock order, so a fork sees no heap mid-update.
  pub fn lock_all(&self) {
    for thread_heap in &self.thread_heaps {
      thread_heap.heap().lock();
    }
    self.heap.lock();
    self.buffer_lock.lock();
  }

  pub fn unlock_all(&self) {
    self.buffer_lock.unlock();
    self.heap.unlock();
    for thread_heap in self.thread_heaps.iter().rev() {
      thread_heap.heap().unlock();
    }
  }

  /// Reopens every heap lock in a fork child.
  ///
  /// # Safety
  ///
  /// Only in the child right after `fork`, while it is still single-threaded.
  ///
  /// Superblock up-locks are not covered. If another parent thread was inside `free` at fork
  /// time, the up-lock of that superblock stays taken in the child, and the child's first `free`
  /// into that superblock spins forever.
  pub unsafe fn reset_locks(&self) {
    unsafe {
      self.buffer_lock.reset();
      self.heap.reset_lock();
      for thread_heap in &self.thread_heaps {
        thread_heap.heap().reset_lock();
      }
    }
  }
}

/// Validity check on the tag of a block about to be used as live.
#[inline]
unsafe fn check_live(block: *mut Block, op: &str) {
  let live = unsafe { (*block).is_allocated() };
  #[cfg(feature = "debug-tripwire")]
  {
    if !live {
      std::process::abort();
    }
  }
  debug_assert!(live, "{}: block {:p} is not allocated (double free?)", op, block);
}
