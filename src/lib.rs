//! Crash-consistent allocator for a memory-mapped persistent pool.
//!
//! ```text
//!   0       4096      8192      12288     16384                  sentinel
//!   ┌───────┬─────────┬─────────┬─────────┬──────┬──────┬─ ─ ─ ─┬──────┐
//!   │ null  │ static  │ red     │ header  │ blk  │ blk  │  ...   │ 0    │
//!   │ page  │ roots   │ zone    │ sig+len │      │      │        │      │
//!   └───────┴─────────┴─────────┴─────────┴──────┴──────┴─ ─ ─ ─┴──────┘
//! ```
//!
//! Blocks move `Free -> Reserved -> Activating -> Active -> Freeing -> Free`.
//! `Activating` and `Freeing` are commit points: once either is durable, a
//! crash is resolved forward at the next open, including the deferred pointer
//! writes registered with [`Pool::onactive`] and [`Pool::onfree`]. A crash in
//! `Reserved` returns the block to the free pool.

mod check;
mod clump;
mod error;
mod heap;
mod layout;
mod lock;
mod media;
mod pool;

pub use crate::{
  check::{CheckReport, StateStats, check},
  clump::State,
  error::{Error, Result},
  heap::RecoveryReport,
  layout::{
    CHUNK_SIZE, CLUMP_OFFSET, HDR_OFFSET, MIN_POOL_SIZE, NULL_OFFSET, NUM_ON, PAGE_SIZE,
    RED_OFFSET, RelPtr, STATIC_OFFSET, STATIC_SIZE, STATIC_SLOTS,
  },
  media::{FlushMode, MappedFile, Media, MemMedia},
  pool::{Pool, PoolConfig, pool_init},
};
