use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::platform;

/// Busy-wait iterations before a waiter starts yielding the processor.
const SPIN_LIMIT: u32 = 128;

/// Test-and-test-and-set lock. Critical sections in this crate are short, so waiters spin for a
/// while and then fall back to yielding.
pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    if self.try_lock() {
      return;
    }
    let mut spins = 0u32;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPIN_LIMIT {
          spins += 1;
          hint::spin_loop();
        } else {
          platform::yield_now();
        }
      }
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    debug_assert!(self.is_locked(), "unlock of an unlocked SpinLock");
    self.locked.store(false, Ordering::Release);
  }

  #[inline]
  pub(crate) fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }

  /// Forces the lock open regardless of who holds it.
  ///
  /// Only sound in a freshly forked child, where the holder no longer exists.
  pub(crate) unsafe fn reset(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    cell::UnsafeCell,
    sync::Arc,
    thread,
  };

  struct Shared {
    lock: SpinLock,
    counter: UnsafeCell<u64>,
  }

  unsafe impl Sync for Shared {}

  #[test]
  fn try_lock_fails_while_held() {
    let lock = SpinLock::new();
    assert!(lock.try_lock());
    assert!(lock.is_locked());
    assert!(!lock.try_lock());
    lock.unlock();
    assert!(!lock.is_locked());
    assert!(lock.try_lock());
    lock.unlock();
  }

  #[test]
  fn reset_releases_a_held_lock() {
    let lock = SpinLock::new();
    lock.lock();
    unsafe { lock.reset() };
    assert!(lock.try_lock());
    lock.unlock();
  }

  #[test]
  fn serializes_increments_across_threads() {
    const THREADS: u64 = 8;
    const ROUNDS: u64 = 10_000;

    let shared = Arc::new(Shared {
      lock: SpinLock::new(),
      counter: UnsafeCell::new(0),
    });

    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
          for _ in 0..ROUNDS {
            shared.lock.lock();
            unsafe { *shared.counter.get() += 1 };
            shared.lock.unlock();
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(unsafe { *shared.counter.get() }, THREADS * ROUNDS);
  }
}
