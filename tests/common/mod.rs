#![allow(dead_code)]

use std::{
  ptr::NonNull,
  sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::Duration,
};

use hoardalloc::{OsMemory, RawMemory};

/// `OsMemory` with call counters and an optional cap on bytes outstanding.
pub struct CountingMemory {
  inner: OsMemory,
  limit: usize,
  pub acquired: AtomicUsize,
  pub released: AtomicUsize,
  pub bytes_outstanding: AtomicUsize,
}

impl CountingMemory {
  pub const fn new() -> Self {
    Self::with_limit(usize::MAX)
  }

  pub const fn with_limit(limit: usize) -> Self {
    Self {
      inner: OsMemory::new(),
      limit,
      acquired: AtomicUsize::new(0),
      released: AtomicUsize::new(0),
      bytes_outstanding: AtomicUsize::new(0),
    }
  }

  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }

  pub fn released(&self) -> usize {
    self.released.load(Ordering::SeqCst)
  }

  pub fn bytes_outstanding(&self) -> usize {
    self.bytes_outstanding.load(Ordering::SeqCst)
  }
}

unsafe impl RawMemory for CountingMemory {
  fn acquire(&self, size: usize) -> Option<NonNull<u8>> {
    let reserved = self
      .bytes_outstanding
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
        now.checked_add(size).filter(|&total| total <= self.limit)
      });
    if reserved.is_err() {
      return None;
    }
    match self.inner.acquire(size) {
      Some(ptr) => {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
      }
      None => {
        self.bytes_outstanding.fetch_sub(size, Ordering::SeqCst);
        None
      }
    }
  }

  unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
    self.released.fetch_add(1, Ordering::SeqCst);
    self.bytes_outstanding.fetch_sub(size, Ordering::SeqCst);
    unsafe { self.inner.release(ptr, size) };
  }
}

/// xorshift64*, enough to shuffle test workloads reproducibly.
pub struct Rng(u64);

impl Rng {
  pub fn new(seed: u64) -> Self {
    Self(seed.max(1))
  }

  pub fn next(&mut self) -> u64 {
    self.0 ^= self.0 >> 12;
    self.0 ^= self.0 << 25;
    self.0 ^= self.0 >> 27;
    self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
  }

  pub fn below(&mut self, bound: usize) -> usize {
    (self.next() % bound as u64) as usize
  }
}

/// Runs `body` on its own thread and fails the test if it has not finished within `limit`.
/// A deadlocked allocator then fails the run instead of hanging it.
pub fn within<F>(limit: Duration, body: F)
where
  F: FnOnce() + Send + 'static,
{
  let (done, finished) = mpsc::channel();
  let worker = thread::spawn(move || {
    body();
    let _ = done.send(());
  });
  match finished.recv_timeout(limit) {
    Ok(()) => worker.join().unwrap(),
    Err(mpsc::RecvTimeoutError::Timeout) => panic!("no progress within {limit:?}, likely deadlocked"),
    // The body panicked before signalling; surface its panic.
    Err(mpsc::RecvTimeoutError::Disconnected) => {
      if let Err(panic) = worker.join() {
        std::panic::resume_unwind(panic);
      }
    }
  }
}
