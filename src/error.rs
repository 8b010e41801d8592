//! Error types for pool and allocator operations.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{NUM_ON, RelPtr, State};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
  /// Pool is too small to hold the fixed pages plus one block.
  #[error("pool size {size} is below the minimum of {min} bytes")]
  InvalidSize { size: u64, min: u64 },

  /// Creating, mapping, locking or syncing the pool file failed.
  #[error("i/o error on {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// Header page does not describe a pool of this size.
  #[error("bad pool signature: {cause}")]
  BadSignature { cause: &'static str },

  /// No free block is large enough, even after coalescing.
  #[error("no free block large enough for {requested} bytes")]
  OutOfSpace { requested: u64 },

  /// Caller drove a block through an illegal transition.
  #[error("block at {offset} is {found}, expected {expected}")]
  ProtocolViolation {
    offset: RelPtr,
    found: State,
    expected: State,
  },

  /// The block already carries `NUM_ON` deferred writes.
  #[error("on-list of block at {offset} is full ({NUM_ON} entries)")]
  OnListFull { offset: RelPtr },

  /// Access range falls outside the region it is allowed to touch.
  #[error("access of {len} bytes at {offset} is outside the pool")]
  OutOfBounds { offset: RelPtr, len: u64 },

  /// Deferred pointer destinations must be 8-byte aligned.
  #[error("deferred write destination {offset} is not 8-byte aligned")]
  Misaligned { offset: RelPtr },

  /// On-media structure is inconsistent.
  #[error("pool corrupt at {offset}: {cause}")]
  Corrupt { offset: RelPtr, cause: String },
}

impl Error {
  pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }

  pub(crate) fn corrupt(offset: usize, cause: impl Into<String>) -> Self {
    Self::Corrupt {
      offset: RelPtr::new(offset as u64),
      cause: cause.into(),
    }
  }

  /// True for errors that mean the caller broke the allocation protocol.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(self, Self::ProtocolViolation { .. })
  }
}
