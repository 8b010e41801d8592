//! Shared helpers for pool integration tests.

#![allow(dead_code)]

use pmalloc::{MIN_POOL_SIZE, MemMedia, Pool, RelPtr, State};

/// A fresh in-memory pool of `size` bytes.
pub fn mem_pool(size: usize) -> Pool<MemMedia> {
  Pool::from_media(MemMedia::create(size).unwrap()).unwrap()
}

pub fn small_pool() -> Pool<MemMedia> {
  mem_pool(MIN_POOL_SIZE)
}

/// Simulates power loss: reopens whatever was durable at this instant.
pub fn crash_and_reopen(pool: &Pool<MemMedia>) -> Pool<MemMedia> {
  Pool::from_media(pool.with_media(|m| m.crash())).unwrap()
}

/// Drops every persist after the next `n`.
pub fn arm_crash(pool: &Pool<MemMedia>, n: usize) {
  pool.with_media(|m| m.crash_after(n));
}

pub fn count(pool: &Pool<impl pmalloc::Media>, state: State) -> u64 {
  pool.stats().unwrap().get(state).count
}

pub fn root(pool: &Pool<impl pmalloc::Media>, i: usize) -> RelPtr {
  pool.root(i).unwrap()
}
