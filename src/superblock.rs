//! Superblocks: fixed-capacity slabs of same-class blocks.
//!
//! The header sits at offset 0 of its chunk and the blocks follow it back to back. Everything in
//! the bookkeeping cell is guarded by the lock of the heap that currently owns the superblock;
//! the owner pointer itself is atomic so that `free` can read it before taking any heap lock.

use core::{
  cell::UnsafeCell,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use crate::{
  block::Block,
  config::{NUM_FULLNESS_BINS, SUPERBLOCK_HEADER_SIZE},
  heap::Heap,
  lock::SpinLock,
  size_class::{block_stride, blocks_per_superblock, superblock_chunk_size},
};

/// Magic number to identify valid superblock headers.
const SUPERBLOCK_MAGIC: u64 = 0x484F_4152_4453_4221; // "HOARDSB!"

struct Bookkeeping {
  prev: *mut Superblock,
  next: *mut Superblock,
  free_list: *mut Block,
  total: u32,
  available: u32,
  fullness: u32,
}

#[repr(C, align(64))]
pub(crate) struct Superblock {
  /// Pins the owner while `free` resolves it.
  up_lock: SpinLock,
  owner: AtomicPtr<Heap>,
  magic: u64,
  /// Raw memory backing this superblock, header included. Fixed at construction.
  chunk_size: usize,
  /// Only changes while no block is live, so `free` may read it without a heap lock.
  size_class: AtomicU32,
  book: UnsafeCell<Bookkeeping>,
}

/// Bin of a superblock with `used` of `total` blocks handed out.
#[inline(always)]
pub(crate) const fn compute_fullness(used: usize, total: usize) -> usize {
  (NUM_FULLNESS_BINS - 1) * used / total
}

impl Superblock {
  /// Turns `chunk` into a superblock of `class` with every block free.
  ///
  /// # Safety
  ///
  /// `chunk` must be valid for `chunk_size` bytes, aligned to at least 64 bytes, and not in use
  /// by anything else. `chunk_size` must be large enough for `class`.
  pub(crate) unsafe fn construct(
    chunk: NonNull<u8>,
    chunk_size: usize,
    class: usize,
    owner: *const Heap,
  ) -> *mut Superblock {
    let sb = chunk.as_ptr() as *mut Superblock;
    unsafe {
      sb.write(Superblock {
        up_lock: SpinLock::new(),
        owner: AtomicPtr::new(owner as *mut Heap),
        magic: SUPERBLOCK_MAGIC,
        chunk_size,
        size_class: AtomicU32::new(0),
        book: UnsafeCell::new(Bookkeeping {
          prev: null_mut(),
          next: null_mut(),
          free_list: null_mut(),
          total: 0,
          available: 0,
          fullness: 0,
        }),
      });
      Self::format(sb, class);
    }
    sb
  }

  /// Lays out the blocks of `class` and threads all of them onto the free list.
  ///
  /// # Safety
  ///
  /// No block of `sb` may be live, and the caller must hold the owner's lock (or be the only
  /// one who can see `sb`).
  pub(crate) unsafe fn format(sb: *mut Superblock, class: usize) {
    let stride = block_stride(class);
    let count = blocks_per_superblock(class);
    unsafe {
      debug_assert!(
        SUPERBLOCK_HEADER_SIZE + count * stride <= (*sb).chunk_size,
        "format: class {} does not fit a {} byte chunk",
        class,
        (*sb).chunk_size
      );

      let base = (sb as *mut u8).add(SUPERBLOCK_HEADER_SIZE);
      // Thread in address order so a fresh superblock hands out ascending addresses.
      let mut next: *mut Block = null_mut();
      for i in (0..count).rev() {
        let block = base.add(i * stride) as *mut Block;
        Block::format(block, sb, next);
        next = block;
      }

      (*sb).size_class.store(class as u32, Ordering::Relaxed);
      let book = &mut *(*sb).book.get();
      book.free_list = next;
      book.total = count as u32;
      book.available = count as u32;
      book.fullness = compute_fullness(0, count) as u32;
    }
  }

  /// Prepares an empty, recycled superblock for `class`.
  ///
  /// # Safety
  ///
  /// Same as [`Superblock::format`]; additionally `sb` must be a standard-size chunk when the
  /// class changes.
  pub(crate) unsafe fn reformat(sb: *mut Superblock, class: usize) {
    unsafe {
      debug_assert!((*sb).is_empty(), "reformat: superblock {:p} still has live blocks", sb);
      if (*sb).size_class() != class {
        debug_assert_eq!(superblock_chunk_size(class), (*sb).chunk_size);
        Self::format(sb, class);
      }
    }
  }

  /// Pops a free block. Null only when nothing is available.
  ///
  /// # Safety
  ///
  /// The caller must hold the owner's lock.
  #[inline]
  pub(crate) unsafe fn get_block(sb: *mut Superblock) -> *mut Block {
    let book = unsafe { &mut *(*sb).book.get() };
    let block = book.free_list;
    if block.is_null() {
      debug_assert_eq!(book.available, 0);
      return null_mut();
    }
    debug_assert!(book.available > 0);
    book.free_list = unsafe { (*block).next() };
    book.available -= 1;
    book.fullness = compute_fullness((book.total - book.available) as usize, book.total as usize) as u32;
    block
  }

  /// Pushes a block of this superblock back onto its free list.
  ///
  /// # Safety
  ///
  /// The caller must hold the owner's lock, and `block` must be a live block of `sb`.
  #[inline]
  pub(crate) unsafe fn put_block(sb: *mut Superblock, block: *mut Block) {
    let book = unsafe { &mut *(*sb).book.get() };
    debug_assert!(
      book.available < book.total,
      "put_block: superblock {:p} already has {} of {} blocks free",
      sb,
      book.available,
      book.total
    );
    unsafe { (*block).set_next(book.free_list) };
    book.free_list = block;
    book.available += 1;
    book.fullness = compute_fullness((book.total - book.available) as usize, book.total as usize) as u32;
  }

  #[inline]
  fn book(&self) -> &Bookkeeping {
    unsafe { &*self.book.get() }
  }

  #[inline]
  pub(crate) fn size_class(&self) -> usize {
    self.size_class.load(Ordering::Relaxed) as usize
  }

  #[inline]
  pub(crate) fn total(&self) -> usize {
    self.book().total as usize
  }

  #[inline]
  pub(crate) fn available(&self) -> usize {
    self.book().available as usize
  }

  #[inline]
  pub(crate) fn used(&self) -> usize {
    self.total() - self.available()
  }

  #[inline]
  pub(crate) fn fullness(&self) -> usize {
    self.book().fullness as usize
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.book().available == self.book().total
  }

  #[cfg(test)]
  pub(crate) fn is_full(&self) -> bool {
    self.fullness() == NUM_FULLNESS_BINS - 1
  }

  #[inline]
  pub(crate) fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  #[inline]
  pub(crate) fn is_valid(&self) -> bool {
    self.magic == SUPERBLOCK_MAGIC
  }

  // Intrusive links. The caller holds the lock of the heap whose list `self` is on.

  #[inline]
  pub(crate) fn prev(&self) -> *mut Superblock {
    self.book().prev
  }

  #[inline]
  pub(crate) fn next(&self) -> *mut Superblock {
    self.book().next
  }

  #[inline]
  pub(crate) unsafe fn set_prev(&self, prev: *mut Superblock) {
    unsafe { (*self.book.get()).prev = prev };
  }

  #[inline]
  pub(crate) unsafe fn set_next(&self, next: *mut Superblock) {
    unsafe { (*self.book.get()).next = next };
  }

  #[inline]
  pub(crate) fn owner(&self) -> *const Heap {
    self.owner.load(Ordering::Acquire)
  }

  /// # Safety
  ///
  /// The caller must hold the locks of both the old and the new owner.
  #[inline]
  pub(crate) unsafe fn set_owner(&self, heap: *const Heap) {
    self.owner.store(heap as *mut Heap, Ordering::Release);
  }

  #[inline]
  pub(crate) fn up_lock(&self) {
    self.up_lock.lock();
  }

  #[inline]
  pub(crate) fn up_unlock(&self) {
    self.up_lock.unlock();
  }
}
