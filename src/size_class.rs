//! Size classes.
//!
//! Class sizes grow geometrically by roughly 1.2x (never by less than one alignment step), which
//! keeps internal fragmentation of any object under 2x. Every table here is built at compile
//! time, so lookups never race with initialization.

use crate::config::{
  ALIGNMENT, BLOCK_HEADER_SIZE, PAGE_SIZE, RELEASE_SLACK_SUPERBLOCKS, SIZE_CLASS_LIMIT,
  SUPERBLOCK_HEADER_SIZE, SUPERBLOCK_SIZE, align_up,
};

/// Sizes up to this bound are resolved through a direct lookup table.
const SMALL_LOOKUP_MAX: usize = 1024;
const SMALL_LOOKUP_LEN: usize = SMALL_LOOKUP_MAX / ALIGNMENT + 1;

const fn next_class_size(prev: usize) -> usize {
  let grown = prev + prev / 5;
  let stepped = if grown > prev + ALIGNMENT {
    grown
  } else {
    prev + ALIGNMENT
  };
  let size = align_up(stepped, ALIGNMENT);
  if size > SIZE_CLASS_LIMIT {
    SIZE_CLASS_LIMIT
  } else {
    size
  }
}

const fn count_size_classes() -> usize {
  let mut count = 1;
  let mut size = ALIGNMENT;
  while size < SIZE_CLASS_LIMIT {
    size = next_class_size(size);
    count += 1;
  }
  count
}

/// Total number of size classes.
pub const SIZE_CLASS_COUNT: usize = count_size_classes();

const fn build_sizes() -> [usize; SIZE_CLASS_COUNT] {
  let mut table = [0; SIZE_CLASS_COUNT];
  let mut size = ALIGNMENT;
  let mut class = 0;
  while class < SIZE_CLASS_COUNT {
    table[class] = size;
    size = next_class_size(size);
    class += 1;
  }
  table
}

const SIZES: [usize; SIZE_CLASS_COUNT] = build_sizes();

const fn build_small_lookup() -> [u8; SMALL_LOOKUP_LEN] {
  let mut table = [0; SMALL_LOOKUP_LEN];
  let mut slot = 0;
  let mut class = 0;
  while slot < SMALL_LOOKUP_LEN {
    while SIZES[class] < slot * ALIGNMENT {
      class += 1;
    }
    table[slot] = class as u8;
    slot += 1;
  }
  table
}

const SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = build_small_lookup();

/// Byte distance between consecutive blocks of a class, header included.
#[inline(always)]
pub const fn block_stride(class: usize) -> usize {
  align_up(BLOCK_HEADER_SIZE + SIZES[class], ALIGNMENT)
}

/// Whether `class` gets a dedicated single-block chunk instead of a slice of a refill.
///
/// A dedicated chunk may still round up to exactly `SUPERBLOCK_SIZE` bytes, so callers must
/// branch on this and never on the chunk size.
#[inline(always)]
pub const fn is_dedicated(class: usize) -> bool {
  block_stride(class) * 2 > SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE
}

/// Bytes of raw memory backing one superblock of `class`.
///
/// Classes that fit at least twice into a standard superblock share the standard chunk size.
/// Anything larger gets a dedicated, page-rounded chunk holding exactly one block.
pub const fn superblock_chunk_size(class: usize) -> usize {
  if is_dedicated(class) {
    align_up(SUPERBLOCK_HEADER_SIZE + block_stride(class), PAGE_SIZE)
  } else {
    SUPERBLOCK_SIZE
  }
}

const fn compute_blocks_per_superblock(class: usize) -> usize {
  if is_dedicated(class) {
    1
  } else {
    (SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE) / block_stride(class)
  }
}

const fn build_blocks_per_superblock() -> [u32; SIZE_CLASS_COUNT] {
  let mut table = [0; SIZE_CLASS_COUNT];
  let mut class = 0;
  while class < SIZE_CLASS_COUNT {
    table[class] = compute_blocks_per_superblock(class) as u32;
    class += 1;
  }
  table
}

const BLOCKS_PER_SUPERBLOCK: [u32; SIZE_CLASS_COUNT] = build_blocks_per_superblock();

const fn build_release_thresholds() -> [usize; SIZE_CLASS_COUNT] {
  let mut table = [0; SIZE_CLASS_COUNT];
  let mut class = 0;
  while class < SIZE_CLASS_COUNT {
    table[class] = RELEASE_SLACK_SUPERBLOCKS * BLOCKS_PER_SUPERBLOCK[class] as usize;
    class += 1;
  }
  table
}

const RELEASE_THRESHOLDS: [usize; SIZE_CLASS_COUNT] = build_release_thresholds();

/// Largest request `size_class` accepts.
pub const MAX_OBJECT_SIZE: usize = SIZES[SIZE_CLASS_COUNT - 1];

// The small lookup table stores class indices as bytes.
const _: () = assert!(SIZE_CLASS_COUNT <= u8::MAX as usize);
const _: () = assert!(SIZES[0] == ALIGNMENT);
const _: () = assert!(MAX_OBJECT_SIZE == SIZE_CLASS_LIMIT);
const _: () = assert!(BLOCKS_PER_SUPERBLOCK[0] > 1);

/// Returns the smallest class whose size covers `size`, or `None` past the largest class.
/// A zero-byte request is served from the smallest class.
#[inline]
pub fn size_class(size: usize) -> Option<usize> {
  if size <= SMALL_LOOKUP_MAX {
    return Some(SMALL_LOOKUP[size.div_ceil(ALIGNMENT)] as usize);
  }
  if size > MAX_OBJECT_SIZE {
    return None;
  }
  Some(SIZES.partition_point(|&class_size| class_size < size))
}

#[inline(always)]
pub const fn class_size(class: usize) -> usize {
  SIZES[class]
}

#[inline(always)]
pub const fn blocks_per_superblock(class: usize) -> usize {
  BLOCKS_PER_SUPERBLOCK[class] as usize
}

/// Unused blocks of `class` a thread heap tolerates before offering a superblock back.
#[inline(always)]
pub const fn release_threshold(class: usize) -> usize {
  RELEASE_THRESHOLDS[class]
}
