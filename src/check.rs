//! Offline health report for a pool file.

use std::{fmt, fs::File, path::Path};

use memmap2::Mmap;
use tracing::debug;

use crate::{
  clump::{Chain, State},
  error::{Error, Result},
  layout::{self, CHUNK_SIZE, CLUMP_OFFSET},
};

/// Byte and block totals for one class of blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateStats {
  pub bytes: u64,
  pub count: u64,
  pub largest: u64,
  /// Zero when `count` is zero.
  pub smallest: u64,
}

impl StateStats {
  fn add(&mut self, size: u64) {
    self.largest = self.largest.max(size);
    if self.smallest == 0 || size < self.smallest {
      self.smallest = size;
    }
    self.bytes += size;
    self.count += 1;
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckReport {
  pub file_size: u64,
  /// Bytes between the first block and the sentinel.
  pub allocatable: u64,
  /// Indexed by `State as usize`.
  pub states: [StateStats; 5],
  pub total: StateStats,
  /// On-list entries still waiting for a commit.
  pub deferred: u64,
}

impl CheckReport {
  pub fn get(&self, state: State) -> &StateStats {
    &self.states[state as usize]
  }
}

impl fmt::Display for CheckReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Summary of pmem pool:")?;
    writeln!(
      f,
      "File size: {}, {} allocatable bytes in pool",
      self.file_size, self.allocatable
    )?;
    writeln!(f)?;
    writeln!(
      f,
      "{:>10} {:>10} {:>10} {:>10} {:>10}",
      "State", "Bytes", "Clumps", "Largest", "Smallest"
    )?;
    let rows = State::ALL
      .iter()
      .map(|s| (label(*s), self.get(*s)))
      .chain([("TOTAL", &self.total)]);
    for (name, s) in rows {
      writeln!(
        f,
        "{:>10} {:>10} {:>10} {:>10} {:>10}",
        name, s.bytes, s.count, s.largest, s.smallest
      )?;
    }
    if self.deferred > 0 {
      writeln!(f, "{} deferred writes pending", self.deferred)?;
    }
    Ok(())
  }
}

fn label(state: State) -> &'static str {
  match state {
    State::Free => "Free",
    State::Reserved => "Reserved",
    State::Activating => "Activating",
    State::Active => "Active",
    State::Freeing => "Freeing",
  }
}

/// Walks the chain of a verified image and tallies every block.
pub(crate) fn survey(bytes: &[u8]) -> Result<CheckReport> {
  let end = layout::sentinel_offset(bytes.len());
  let mut report = CheckReport {
    file_size: bytes.len() as u64,
    allocatable: (end - CLUMP_OFFSET) as u64,
    states: [StateStats::default(); 5],
    total: StateStats::default(),
    deferred: 0,
  };

  for clump in Chain::new(bytes, CLUMP_OFFSET, end) {
    let clump = clump?;
    let size = clump.size as u64;
    report.states[clump.state as usize].add(size);
    report.total.add(size);
    report.deferred += clump.on.pending().count() as u64;
  }

  if report.total.count == 0 {
    return Err(Error::corrupt(CLUMP_OFFSET, "no clumps found"));
  }
  Ok(report)
}

/// Maps the pool at `path` read-only and reports on its block chain.
///
/// Does not take the pool lock and never writes, so it can inspect a pool
/// that another process holds open, at the risk of seeing a torn chain.
pub fn check(path: impl AsRef<Path>) -> Result<CheckReport> {
  let path = path.as_ref();
  let file = File::open(path).map_err(|e| Error::io(path, e))?;
  let size = file.metadata().map_err(|e| Error::io(path, e))?.len();
  layout::check_size(size)?;

  let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
  let bytes = &mmap[..];
  layout::verify_header(bytes)?;

  let total = bytes.len();
  let clumptotal = layout::chain_bytes(total);
  let accounted = CLUMP_OFFSET + clumptotal + (total & (CHUNK_SIZE - 1)) + CHUNK_SIZE;
  if accounted != total {
    return Err(Error::corrupt(
      CLUMP_OFFSET,
      format!("sections add up to {accounted}, not the file size {total}"),
    ));
  }
  debug!(path = %path.display(), size, clumptotal, "section sizes add up");

  survey(bytes)
}
