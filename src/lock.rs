//! The single pool-wide lock serializing every mutating operation.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Spins before yielding the thread; msync-mode persists can hold the lock
/// across a syscall.
const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct SpinLock<T> {
  locked: AtomicBool,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
  pub(crate) const fn new(data: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
    let mut spins = 0u32;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          std::thread::yield_now();
        }
      }
    }
    SpinGuard { lock: self }
  }

  pub(crate) fn into_inner(self) -> T {
    self.data.into_inner()
  }
}

pub(crate) struct SpinGuard<'a, T> {
  lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    // Holding the guard means `locked` is ours.
    unsafe { &*self.lock.data.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.lock.data.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread};

  #[test]
  fn serializes_increments() {
    let counter = Arc::new(SpinLock::new(0u64));
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
          for _ in 0..10_000 {
            *counter.lock() += 1;
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
  }

  #[test]
  fn into_inner_returns_data() {
    let lock = SpinLock::new(vec![1, 2, 3]);
    lock.lock().push(4);
    assert_eq!(lock.into_inner(), vec![1, 2, 3, 4]);
  }
}
