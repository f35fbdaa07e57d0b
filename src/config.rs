use core::mem::size_of;

use crate::{block::Block, superblock::Superblock};

// =============================================================================
// Constants
// =============================================================================

/// Base alignment of every pointer handed out by `malloc`.
pub const ALIGNMENT: usize = 16;

/// Size of the header sitting right before each user pointer.
pub const BLOCK_HEADER_SIZE: usize = size_of::<Block>();

/// Standard superblock chunk. Classes whose blocks fit at least twice share one of these.
pub const SUPERBLOCK_SIZE: usize = 16 * 1024; // 16KB
pub const SUPERBLOCK_HEADER_SIZE: usize = size_of::<Superblock>();

/// Fullness is quantized into this many bins. The last bin only holds full superblocks.
pub const NUM_FULLNESS_BINS: usize = 8;
pub const FULL_BIN: usize = NUM_FULLNESS_BINS - 1;

/// Whole superblocks of slack a thread heap may hold per class before it gives one back.
pub const RELEASE_SLACK_SUPERBLOCKS: usize = 4;

/// Superblock chunks requested from the OS in one go.
pub const REFILL_COUNT: usize = 16;

/// Upper bound on thread heaps; the live count is derived from the processor count.
pub const MAX_THREAD_HEAPS: usize = 64;

/// Empty superblocks kept for reformatting, per heap kind.
pub const THREAD_REUSABLE_CAP: usize = 2;
pub const PROCESS_REUSABLE_CAP: usize = 64;

/// Granularity of raw memory handed out by the OS.
pub const PAGE_SIZE: usize = 4096;

/// Largest size class. Bigger requests fail with null.
#[cfg(target_pointer_width = "64")]
pub const SIZE_CLASS_LIMIT: usize = 1 << 40;
// Block tags keep the requested size in the upper 24 bits of a 32-bit word.
#[cfg(not(target_pointer_width = "64"))]
pub const SIZE_CLASS_LIMIT: usize = 1 << 23;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= size_of::<usize>());
const _: () = assert!(BLOCK_HEADER_SIZE == ALIGNMENT);
const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_SIZE % PAGE_SIZE == 0);
const _: () = assert!(SUPERBLOCK_HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(SUPERBLOCK_HEADER_SIZE < SUPERBLOCK_SIZE / 4);
const _: () = assert!(NUM_FULLNESS_BINS >= 3);
const _: () = assert!(NUM_FULLNESS_BINS <= u8::MAX as usize);
const _: () = assert!(MAX_THREAD_HEAPS.is_power_of_two());
const _: () = assert!(REFILL_COUNT >= 1);
const _: () = assert!(SIZE_CLASS_LIMIT % ALIGNMENT == 0);

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
