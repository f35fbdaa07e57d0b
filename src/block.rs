//! Block headers.
//!
//! Every object is preceded by a 16-byte [`Block`]. The first word points at the owning
//! superblock; the second is the free-list link while the block is free, or an allocation tag
//! (with the requested size packed above it) while it is live.
//!
//! `memalign` may hand out a pointer deep inside a block. It then writes a forwarding header
//! right before the aligned pointer whose first word is the address of the real header with
//! [`FORWARD_TAG`] set. Superblocks are at least 16-byte aligned, so that bit is otherwise zero.

use core::ptr::null_mut;

use crate::{
  config::{BLOCK_HEADER_SIZE, SIZE_CLASS_LIMIT},
  superblock::Superblock,
};

const FORWARD_TAG: usize = 1;

/// Odd, so it can never be mistaken for a free-list link.
const ALLOCATED_TAG: usize = 0xA5;
const TAG_BITS: u32 = 8;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

// Every requested size must survive the shift into the tag.
const _: () = assert!(SIZE_CLASS_LIMIT <= usize::MAX >> TAG_BITS);

#[repr(C, align(16))]
pub(crate) struct Block {
  owner: usize,
  state: usize,
}

impl Block {
  /// Writes a free block header at `block`.
  #[inline]
  pub(crate) unsafe fn format(block: *mut Block, superblock: *mut Superblock, next: *mut Block) {
    unsafe {
      block.write(Block {
        owner: superblock as usize,
        state: next as usize,
      })
    };
  }

  /// Recovers the header of a pointer returned by `malloc`/`memalign`.
  ///
  /// This is the one place that steps backwards from a user pointer. Forwarding headers written
  /// by [`Block::write_forward`] are followed, so the result is always the real header.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live pointer produced by this allocator.
  #[inline]
  pub(crate) unsafe fn from_user_ptr(ptr: *mut u8) -> *mut Block {
    let header = unsafe { ptr.sub(BLOCK_HEADER_SIZE) } as *mut Block;
    let owner = unsafe { (*header).owner };
    if owner & FORWARD_TAG != 0 {
      (owner & !FORWARD_TAG) as *mut Block
    } else {
      header
    }
  }

  /// Writes a forwarding header right before `aligned`, pointing back at `target`.
  ///
  /// # Safety
  ///
  /// The 16 bytes before `aligned` must lie inside the user area of `target`.
  pub(crate) unsafe fn write_forward(aligned: *mut u8, target: *mut Block) {
    let header = unsafe { aligned.sub(BLOCK_HEADER_SIZE) } as *mut Block;
    debug_assert!(header as usize > target as usize);
    unsafe {
      header.write(Block {
        owner: target as usize | FORWARD_TAG,
        state: ALLOCATED_TAG,
      })
    };
  }

  #[inline(always)]
  pub(crate) fn user_ptr(block: *mut Block) -> *mut u8 {
    (block as *mut u8).wrapping_add(BLOCK_HEADER_SIZE)
  }

  #[inline]
  pub(crate) fn superblock(&self) -> *mut Superblock {
    debug_assert!(self.owner & FORWARD_TAG == 0);
    self.owner as *mut Superblock
  }

  /// Free-list successor. Only meaningful while the block is free.
  #[inline]
  pub(crate) fn next(&self) -> *mut Block {
    if self.is_allocated() {
      null_mut()
    } else {
      self.state as *mut Block
    }
  }

  #[inline]
  pub(crate) fn set_next(&mut self, next: *mut Block) {
    self.state = next as usize;
  }

  #[inline]
  pub(crate) fn mark_allocated(&mut self, requested: usize) {
    debug_assert!(requested <= SIZE_CLASS_LIMIT);
    self.state = (requested << TAG_BITS) | ALLOCATED_TAG;
  }

  #[inline]
  pub(crate) fn is_allocated(&self) -> bool {
    self.state & TAG_MASK == ALLOCATED_TAG
  }

  /// Byte count passed to `malloc` for this block.
  #[inline]
  pub(crate) fn requested_size(&self) -> usize {
    debug_assert!(self.is_allocated());
    self.state >> TAG_BITS
  }
}
