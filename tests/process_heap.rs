mod common;

use common::{CountingMemory, Rng};
use hoardalloc::{
  ALIGNMENT, MAX_OBJECT_SIZE, NUM_FULLNESS_BINS, ProcessHeap, REFILL_COUNT, SIZE_CLASS_COUNT,
  SUPERBLOCK_SIZE, THREAD_REUSABLE_CAP, blocks_per_superblock, is_dedicated, release_threshold,
  size_class, superblock_chunk_size,
};
use std::ptr::null_mut;

fn live_blocks(heap: &ProcessHeap<CountingMemory>) -> usize {
  (0..=heap.thread_heap_count())
    .flat_map(|index| (0..SIZE_CLASS_COUNT).map(move |class| heap.usage(index, class).in_use))
    .sum()
}

#[test]
fn freed_blocks_are_reused_before_new_superblocks() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  HEAP.configure(1);

  let mut ptrs: Vec<*mut u8> = (0..1000).map(|_| HEAP.malloc(64)).collect();
  assert!(ptrs.iter().all(|p| !p.is_null()));
  let created = HEAP.superblocks_created();
  let class = size_class(64).unwrap();
  assert_eq!(created, 1000usize.div_ceil(blocks_per_superblock(class)));

  for ptr in ptrs.iter_mut().step_by(2) {
    unsafe { HEAP.free(*ptr) };
    *ptr = null_mut();
  }
  for ptr in ptrs.iter_mut().step_by(2) {
    *ptr = HEAP.malloc(64);
    assert!(!ptr.is_null());
  }
  assert_eq!(HEAP.superblocks_created(), created);

  let index = HEAP.current_heap_index();
  assert_eq!(HEAP.usage(index, class).in_use, 1000);

  for ptr in ptrs {
    unsafe { HEAP.free(ptr) };
  }
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn realloc_within_the_block_keeps_the_pointer() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());

  let ptr = HEAP.malloc(200);
  unsafe {
    ptr.write_bytes(0x5A, 200);
    let shrunk = HEAP.realloc(ptr, 50);
    assert_eq!(shrunk, ptr);
    assert_eq!(HEAP.requested_size(shrunk), 50);

    let usable = HEAP.object_size(ptr);
    assert_eq!(HEAP.realloc(ptr, usable), ptr);

    let grown = HEAP.realloc(ptr, usable + 1);
    assert_ne!(grown, ptr);
    assert_eq!(HEAP.requested_size(grown), usable + 1);
    assert!((0..50).all(|i| *grown.add(i) == 0x5A));

    assert!(HEAP.realloc(grown, 0).is_null());
    let fresh = HEAP.realloc(null_mut(), 10);
    assert!(!fresh.is_null());
    HEAP.free(fresh);
  }
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn memalign_returns_aligned_freeable_pointers() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());

  for alignment in [1, 16, 32, 64, 512, 4096, 65536] {
    let ptr = HEAP.memalign(alignment, 100);
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % alignment, 0);
    unsafe {
      assert!(HEAP.object_size(ptr) >= 100);
      assert_eq!(HEAP.requested_size(ptr), 100);
      ptr.write_bytes(0xEE, 100);
      HEAP.free(ptr);
    }
  }
  assert!(HEAP.memalign(48, 100).is_null());
  assert!(HEAP.memalign(0, 100).is_null());
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn calloc_zeroes_and_rejects_overflow() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());

  assert!(HEAP.calloc(usize::MAX / 2, 3).is_null());

  let dirty = HEAP.malloc(256);
  unsafe {
    dirty.write_bytes(0xFF, 256);
    HEAP.free(dirty);
  }
  let clean = HEAP.calloc(16, 16);
  assert!(!clean.is_null());
  unsafe {
    assert!((0..256).all(|i| *clean.add(i) == 0));
    HEAP.free(clean);
  }
}

#[test]
fn every_size_is_aligned_and_fits() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());

  let mut sizes: Vec<usize> = (0..=2048).collect();
  sizes.extend((2049..200_000).step_by(997));
  sizes.extend([SUPERBLOCK_SIZE, 1 << 20, 3 << 20]);

  let ptrs: Vec<(*mut u8, usize)> = sizes
    .iter()
    .map(|&size| {
      let ptr = HEAP.malloc(size);
      assert!(!ptr.is_null(), "malloc({}) failed", size);
      assert_eq!(ptr as usize % ALIGNMENT, 0);
      unsafe {
        assert!(HEAP.object_size(ptr) >= size);
        assert_eq!(HEAP.requested_size(ptr), size);
        ptr.write_bytes((size % 251) as u8, size);
      }
      (ptr, size)
    })
    .collect();

  for &(ptr, size) in &ptrs {
    if size > 0 {
      let fill = (size % 251) as u8;
      unsafe {
        assert_eq!(*ptr, fill);
        assert_eq!(*ptr.add(size - 1), fill);
      }
    }
  }
  for (ptr, _) in ptrs {
    unsafe { HEAP.free(ptr) };
  }
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn oversized_requests_and_null_free() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());

  assert!(HEAP.malloc(usize::MAX).is_null());
  assert!(HEAP.malloc(MAX_OBJECT_SIZE + 1).is_null());
  assert!(HEAP.memalign(4096, usize::MAX - 10).is_null());
  unsafe { HEAP.free(null_mut()) };
  assert_eq!(HEAP.memory().acquired(), 0);
}

#[test]
fn random_interleaving_keeps_counters_consistent() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  HEAP.configure(4);

  let mut rng = Rng::new(0x5EED);
  let mut live: Vec<(*mut u8, usize)> = Vec::new();
  for step in 0..20_000 {
    if live.is_empty() || rng.below(100) < 55 {
      let size = match rng.below(10) {
        0 => rng.below(64 * 1024),
        _ => rng.below(512),
      };
      let ptr = HEAP.malloc(size);
      assert!(!ptr.is_null());
      unsafe { ptr.write_bytes(size as u8, size) };
      live.push((ptr, size));
    } else {
      let (ptr, size) = live.swap_remove(rng.below(live.len()));
      if size > 0 {
        unsafe { assert_eq!(*ptr.add(size - 1), size as u8) };
      }
      unsafe { HEAP.free(ptr) };
    }

    if step % 1000 == 0 {
      for index in 0..=HEAP.thread_heap_count() {
        for class in 0..SIZE_CLASS_COUNT {
          let usage = HEAP.usage(index, class);
          assert!(usage.in_use <= usage.allocated, "heap {} class {}: {:?}", index, class, usage);
        }
      }
      assert_eq!(live_blocks(&HEAP), live.len());
    }
  }

  for (ptr, _) in live {
    unsafe { HEAP.free(ptr) };
  }
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn idle_thread_heap_memory_is_bounded() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  assert!(HEAP.configure(4));

  let class = size_class(128).unwrap();
  let per_superblock = blocks_per_superblock(class);
  let count = 20 * per_superblock;

  let ptrs: Vec<*mut u8> = (0..count).map(|_| HEAP.malloc(128)).collect();
  let created = HEAP.superblocks_created();
  let index = HEAP.current_heap_index();
  assert_eq!(HEAP.usage(index, class).in_use, count);

  for &ptr in &ptrs {
    unsafe { HEAP.free(ptr) };
  }

  let usage = HEAP.usage(index, class);
  assert_eq!(usage.in_use, 0);
  assert!(
    usage.allocated <= release_threshold(class),
    "thread heap kept {} idle blocks",
    usage.allocated
  );
  assert!(HEAP.reusable_superblocks(index) <= THREAD_REUSABLE_CAP);
  assert!(HEAP.usage(0, class).allocated > 0 || HEAP.reusable_superblocks(0) > 0);

  // The same demand again is served from superblocks handed to the process heap.
  let ptrs: Vec<*mut u8> = (0..count).map(|_| HEAP.malloc(128)).collect();
  assert_eq!(HEAP.superblocks_created(), created);
  for ptr in ptrs {
    unsafe { HEAP.free(ptr) };
  }
}

#[test]
fn steady_working_set_bounds_thread_heap_memory() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  assert!(HEAP.configure(4));

  let class = size_class(128).unwrap();
  let per_superblock = blocks_per_superblock(class);
  let threshold = release_threshold(class);
  let working_set = 3 * per_superblock;
  let churn = 10 * per_superblock;
  let index = HEAP.current_heap_index();

  // Idle memory stays within a constant factor of the working set, or within the slack.
  let ratio_bound = working_set * (NUM_FULLNESS_BINS - 1) / (NUM_FULLNESS_BINS - 2);
  let bound = (working_set + threshold).max(ratio_bound) + per_superblock;

  let mut rng = Rng::new(0x5EED);
  let kept: Vec<*mut u8> = (0..working_set).map(|_| HEAP.malloc(128)).collect();
  assert!(kept.iter().all(|p| !p.is_null()));

  let mut created_after_first_round = 0;
  for round in 0..50 {
    let mut extra: Vec<*mut u8> = (0..churn).map(|_| HEAP.malloc(128)).collect();
    assert!(extra.iter().all(|p| !p.is_null()));
    while !extra.is_empty() {
      let ptr = extra.swap_remove(rng.below(extra.len()));
      unsafe { HEAP.free(ptr) };
    }

    let usage = HEAP.usage(index, class);
    assert!(usage.in_use <= working_set);
    assert!(
      usage.allocated <= bound,
      "round {round}: {} blocks allocated for a working set of {working_set} (bound {bound})",
      usage.allocated
    );

    if round == 0 {
      created_after_first_round = HEAP.superblocks_created();
    }
  }
  // Later rounds run entirely on superblocks handed back and forth.
  assert_eq!(HEAP.superblocks_created(), created_after_first_round);

  for ptr in kept {
    unsafe { HEAP.free(ptr) };
  }
  assert_eq!(live_blocks(&HEAP), 0);
}

#[test]
fn dedicated_class_at_standard_size_owns_its_chunk() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  let memory = HEAP.memory();

  let class = size_class(13_000).unwrap();
  assert!(is_dedicated(class));
  assert_eq!(superblock_chunk_size(class), SUPERBLOCK_SIZE);

  // Start a refill so a carved chunk would be indistinguishable by size alone.
  let small = HEAP.malloc(64);
  assert!(!small.is_null());
  assert_eq!(memory.acquired(), 1);
  let refill_bytes = REFILL_COUNT * SUPERBLOCK_SIZE;
  assert_eq!(memory.bytes_outstanding(), refill_bytes);

  for round in 1..=3 {
    let ptr = HEAP.malloc(13_000);
    assert!(!ptr.is_null());
    unsafe { ptr.write_bytes(0xAB, 13_000) };
    assert_eq!(memory.acquired(), 1 + round);
    assert_eq!(memory.bytes_outstanding(), refill_bytes + SUPERBLOCK_SIZE);

    unsafe { HEAP.free(ptr) };
    assert_eq!(memory.released(), round);
    assert_eq!(memory.bytes_outstanding(), refill_bytes);
    assert_eq!(HEAP.usage(HEAP.current_heap_index(), class).allocated, 0);
  }

  unsafe { HEAP.free(small) };
  assert_eq!(live_blocks(&HEAP), 0);
  assert_eq!(memory.bytes_outstanding(), refill_bytes);
}

#[test]
fn single_block_superblocks_go_back_to_the_backend() {
  static HEAP: ProcessHeap<CountingMemory> = ProcessHeap::new(CountingMemory::new());
  let memory = HEAP.memory();

  let size = 1 << 20;
  let class = size_class(size).unwrap();
  assert_eq!(blocks_per_superblock(class), 1);

  let ptr = HEAP.malloc(size);
  assert!(!ptr.is_null());
  assert_eq!(memory.acquired(), 1);
  assert!(memory.bytes_outstanding() > size);

  unsafe { HEAP.free(ptr) };
  assert_eq!(memory.released(), 1);
  assert_eq!(memory.bytes_outstanding(), 0);
  assert_eq!(HEAP.usage(HEAP.current_heap_index(), class).allocated, 0);
}

#[test]
fn exhausted_backend_yields_null() {
  static HEAP: ProcessHeap<CountingMemory> =
    ProcessHeap::new(CountingMemory::with_limit(REFILL_COUNT * SUPERBLOCK_SIZE));
  HEAP.configure(1);

  let class = size_class(64).unwrap();
  let mut ptrs = Vec::new();
  loop {
    let ptr = HEAP.malloc(64);
    if ptr.is_null() {
      break;
    }
    ptrs.push(ptr);
  }
  assert_eq!(ptrs.len(), REFILL_COUNT * blocks_per_superblock(class));
  assert_eq!(HEAP.superblocks_created(), REFILL_COUNT);
  assert!(HEAP.malloc(1 << 20).is_null());

  // Freed blocks are usable again without more backend memory.
  let last = ptrs.pop().unwrap();
  unsafe { HEAP.free(last) };
  let again = HEAP.malloc(64);
  assert!(!again.is_null());
  ptrs.push(again);

  for ptr in ptrs {
    unsafe { HEAP.free(ptr) };
  }
  assert_eq!(live_blocks(&HEAP), 0);
}
