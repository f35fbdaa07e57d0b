//! The heap base shared by thread heaps and the process heap.
//!
//! A heap files its superblocks in a grid of intrusive doubly linked lists indexed by
//! `[fullness bin][size class]`, keeps `(in_use, allocated)` block counters per class, and holds
//! a small stack of empty superblocks that can be reformatted for any class. Every method that
//! touches the grid requires the heap lock.

use core::{cell::UnsafeCell, ptr::null_mut};

use crate::{
  block::Block,
  config::{FULL_BIN, NUM_FULLNESS_BINS, PROCESS_REUSABLE_CAP, THREAD_REUSABLE_CAP},
  lock::SpinLock,
  platform::RawMemory,
  process_heap::ProcessHeap,
  size_class::{SIZE_CLASS_COUNT, is_dedicated, release_threshold},
  superblock::Superblock,
};

/// Cache value after an insert: assume every non-full bin may be occupied.
const RESET_LEAST_EMPTY_BIN: u8 = (FULL_BIN - 1) as u8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum HeapKind {
  Process,
  Thread,
}

/// Block counters of one size class in one heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassUsage {
  /// Blocks currently handed out to the application.
  pub in_use: usize,
  /// Blocks held by this heap's binned superblocks, live or free.
  pub allocated: usize,
  /// High-water mark of `in_use`.
  pub max_in_use: usize,
  /// High-water mark of `allocated`.
  pub max_allocated: usize,
}

impl ClassUsage {
  const ZERO: Self = Self {
    in_use: 0,
    allocated: 0,
    max_in_use: 0,
    max_allocated: 0,
  };

  #[inline]
  fn add(&mut self, used: usize, total: usize) {
    self.in_use += used;
    self.allocated += total;
    self.max_in_use = self.max_in_use.max(self.in_use);
    self.max_allocated = self.max_allocated.max(self.allocated);
    debug_assert!(self.in_use <= self.allocated);
  }

  #[inline]
  fn sub(&mut self, used: usize, total: usize) {
    debug_assert!(self.in_use >= used && self.allocated >= total);
    self.in_use -= used;
    self.allocated -= total;
    debug_assert!(self.in_use <= self.allocated);
  }

  #[inline]
  fn take_one(&mut self) {
    self.in_use += 1;
    self.max_in_use = self.max_in_use.max(self.in_use);
    debug_assert!(self.in_use <= self.allocated);
  }

  #[inline]
  fn return_one(&mut self) {
    debug_assert!(self.in_use > 0);
    self.in_use -= 1;
  }

  /// The bounded-blowup test: a thread heap holding this much slack must give a superblock back.
  #[inline]
  pub(crate) fn exceeds_release_threshold(&self, class: usize) -> bool {
    let scale = NUM_FULLNESS_BINS - 1;
    self.in_use + release_threshold(class) < self.allocated
      && scale * self.in_use < scale * self.allocated - self.allocated
  }
}

/// What happened to the superblock a block was freed into.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FreeOutcome {
  Kept,
  /// The superblock held a single block and its memory went back to the backend.
  Destroyed,
}

struct Grid {
  bins: [[*mut Superblock; SIZE_CLASS_COUNT]; NUM_FULLNESS_BINS],
  usage: [ClassUsage; SIZE_CLASS_COUNT],
  /// Per class, every non-full bin above this one is empty.
  least_empty_bin: [u8; SIZE_CLASS_COUNT],
  reusable: *mut Superblock,
  reusable_count: usize,
}

impl Grid {
  const fn new() -> Self {
    Self {
      bins: [[null_mut(); SIZE_CLASS_COUNT]; NUM_FULLNESS_BINS],
      usage: [ClassUsage::ZERO; SIZE_CLASS_COUNT],
      least_empty_bin: [RESET_LEAST_EMPTY_BIN; SIZE_CLASS_COUNT],
      reusable: null_mut(),
      reusable_count: 0,
    }
  }

  /// Pushes `sb` at the head of `[bin][class]`.
  #[inline]
  unsafe fn link(&mut self, sb: *mut Superblock, bin: usize, class: usize) {
    let head = self.bins[bin][class];
    unsafe {
      (*sb).set_prev(null_mut());
      (*sb).set_next(head);
      if !head.is_null() {
        (*head).set_prev(sb);
      }
    }
    self.bins[bin][class] = sb;
    if bin < FULL_BIN && bin as u8 > self.least_empty_bin[class] {
      self.least_empty_bin[class] = bin as u8;
    }
  }

  #[inline]
  unsafe fn unlink(&mut self, sb: *mut Superblock, bin: usize, class: usize) {
    unsafe {
      let prev = (*sb).prev();
      let next = (*sb).next();
      if prev.is_null() {
        debug_assert_eq!(self.bins[bin][class], sb, "unlink: {:p} is not in bin {}", sb, bin);
        self.bins[bin][class] = next;
      } else {
        (*prev).set_next(next);
      }
      if !next.is_null() {
        (*next).set_prev(prev);
      }
      (*sb).set_prev(null_mut());
      (*sb).set_next(null_mut());
    }
  }

  #[inline]
  unsafe fn move_superblock(&mut self, sb: *mut Superblock, class: usize, from: usize, to: usize) {
    unsafe {
      self.unlink(sb, from, class);
      self.link(sb, to, class);
    }
  }

  unsafe fn insert(&mut self, class: usize, sb: *mut Superblock, reusable_cap: usize) {
    unsafe {
      if (*sb).is_empty() && (*sb).total() > 1 {
        self.recycle(sb, reusable_cap);
        return;
      }
      self.link(sb, (*sb).fullness(), class);
      self.least_empty_bin[class] = RESET_LEAST_EMPTY_BIN;
      self.usage[class].add((*sb).used(), (*sb).total());
    }
  }

  unsafe fn recycle(&mut self, sb: *mut Superblock, reusable_cap: usize) {
    unsafe {
      debug_assert!((*sb).is_empty() && (*sb).total() > 1);

      if self.reusable_count < reusable_cap {
        (*sb).set_prev(null_mut());
        (*sb).set_next(self.reusable);
        self.reusable = sb;
        self.reusable_count += 1;
      } else {
        let class = (*sb).size_class();
        self.link(sb, 0, class);
        self.usage[class].add(0, (*sb).total());
      }
    }
  }

  /// Pops a reusable superblock, reformatted for `class`. It is not counted in any stats yet.
  /// Classes with dedicated chunks cannot reuse standard chunks.
  unsafe fn reuse(&mut self, class: usize) -> *mut Superblock {
    let sb = self.reusable;
    if sb.is_null() || is_dedicated(class) {
      return null_mut();
    }
    unsafe {
      self.reusable = (*sb).next();
      self.reusable_count -= 1;
      (*sb).set_next(null_mut());
      Superblock::reformat(sb, class);
    }
    sb
  }

  unsafe fn remove_emptiest(&mut self, class: usize) -> *mut Superblock {
    let top = self.least_empty_bin[class] as usize;
    for bin in 0..=top {
      let sb = self.bins[bin][class];
      if sb.is_null() {
        continue;
      }
      unsafe {
        debug_assert!((*sb).available() > 0);
        debug_assert_eq!((*sb).fullness(), bin);
        self.unlink(sb, bin, class);
        self.usage[class].sub((*sb).used(), (*sb).total());
      }
      return sb;
    }
    null_mut()
  }

  unsafe fn take_block(&mut self, class: usize) -> *mut Block {
    let mut found = null_mut();
    let top = self.least_empty_bin[class] as usize;
    for bin in (0..=top).rev() {
      let sb = self.bins[bin][class];
      if sb.is_null() {
        if bin > 0 && bin == self.least_empty_bin[class] as usize {
          self.least_empty_bin[class] -= 1;
        }
        continue;
      }
      debug_assert!(unsafe { (*sb).available() } > 0);
      found = sb;
      break;
    }

    if found.is_null() {
      found = unsafe { self.reuse(class) };
      if found.is_null() {
        return null_mut();
      }
      unsafe {
        self.link(found, (*found).fullness(), class);
        self.usage[class].add(0, (*found).total());
      }
    }

    unsafe {
      let from = (*found).fullness();
      let block = Superblock::get_block(found);
      debug_assert!(!block.is_null());
      self.usage[class].take_one();
      let to = (*found).fullness();
      if to != from {
        self.move_superblock(found, class, from, to);
      }
      block
    }
  }
}

pub(crate) struct Heap {
  lock: SpinLock,
  kind: HeapKind,
  grid: UnsafeCell<Grid>,
}

impl Heap {
  pub(crate) const fn new(kind: HeapKind) -> Self {
    Self {
      lock: SpinLock::new(),
      kind,
      grid: UnsafeCell::new(Grid::new()),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    self.lock.lock();
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.lock.unlock();
  }

  /// # Safety
  ///
  /// Only in a single-threaded fork child.
  pub(crate) unsafe fn reset_lock(&self) {
    unsafe { self.lock.reset() };
  }

  #[inline]
  #[allow(clippy::mut_from_ref)]
  unsafe fn grid(&self) -> &mut Grid {
    debug_assert!(self.lock.is_locked(), "heap grid accessed without its lock");
    unsafe { &mut *self.grid.get() }
  }

  #[inline]
  fn as_owner(&self) -> *const Heap {
    self as *const Heap
  }

  fn reusable_cap(&self) -> usize {
    match self.kind {
      HeapKind::Process => PROCESS_REUSABLE_CAP,
      HeapKind::Thread => THREAD_REUSABLE_CAP,
    }
  }

  /// Snapshot of the counters of `class`.
  pub(crate) fn usage(&self, class: usize) -> ClassUsage {
    self.lock();
    let usage = unsafe { self.grid() }.usage[class];
    self.unlock();
    usage
  }

  pub(crate) fn reusable_count(&self) -> usize {
    self.lock();
    let count = unsafe { self.grid() }.reusable_count;
    self.unlock();
    count
  }

  /// Takes ownership of `sb` into the grid. Empty multi-block superblocks go to the reusable
  /// stack instead.
  ///
  /// # Safety
  ///
  /// The heap lock is held, `sb` is owned by this heap and is on no list.
  pub(crate) unsafe fn insert_superblock(&self, class: usize, sb: *mut Superblock) {
    unsafe {
      debug_assert_eq!((*sb).owner(), self.as_owner());
      debug_assert_eq!((*sb).size_class(), class);
      self.grid().insert(class, sb, self.reusable_cap());
    }
  }

  /// Detaches a superblock of `class` with at least `1 / NUM_FULLNESS_BINS` of its blocks free,
  /// preferring the reusable stack. Null when there is none.
  ///
  /// # Safety
  ///
  /// The heap lock is held.
  pub(crate) unsafe fn remove_max_superblock(&self, class: usize) -> *mut Superblock {
    let grid = unsafe { self.grid() };
    let sb = unsafe { grid.reuse(class) };
    if !sb.is_null() {
      return sb;
    }
    unsafe { grid.remove_emptiest(class) }
  }

  /// Fast path of `malloc`: takes a block from the fullest superblock that still has room,
  /// falling back to a reusable superblock. Null when this heap has nothing for `class`.
  ///
  /// # Safety
  ///
  /// The heap lock is held.
  pub(crate) unsafe fn find_available_superblock(&self, class: usize) -> *mut Block {
    unsafe { self.grid().take_block(class) }
  }

  /// Returns `block` to `sb`, rebins or recycles `sb`, and on a thread heap hands the emptiest
  /// superblock of the class to the process heap once too much of the class sits idle.
  ///
  /// # Safety
  ///
  /// The heap lock is held, this heap owns `sb`, and `block` is a live block of `sb`. After
  /// [`FreeOutcome::Destroyed`] the memory of `sb` is gone.
  pub(crate) unsafe fn free_block<M: RawMemory>(
    &self,
    block: *mut Block,
    sb: *mut Superblock,
    process: &ProcessHeap<M>,
  ) -> FreeOutcome {
    let grid = unsafe { self.grid() };
    unsafe {
      debug_assert_eq!((*sb).owner(), self.as_owner());
      let class = (*sb).size_class();
      let from = (*sb).fullness();

      Superblock::put_block(sb, block);
      grid.usage[class].return_one();

      if is_dedicated(class) {
        grid.unlink(sb, from, class);
        grid.usage[class].sub(0, 1);
        process.destroy_superblock(sb);
        return FreeOutcome::Destroyed;
      }

      if (*sb).is_empty() {
        grid.unlink(sb, from, class);
        grid.usage[class].sub(0, (*sb).total());
        grid.recycle(sb, self.reusable_cap());
      } else {
        let to = (*sb).fullness();
        if to != from {
          grid.move_superblock(sb, class, from, to);
        }
      }

      if self.kind == HeapKind::Thread
        && process.is_multiprocessor()
        && grid.usage[class].exceeds_release_threshold(class)
      {
        let victim = grid.remove_emptiest(class);
        if !victim.is_null() {
          process.release(victim);
        }
      }
    }
    FreeOutcome::Kept
  }
}
