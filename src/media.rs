//! Byte regions the allocator runs on, and how each makes writes durable.
//!
//! The allocator never flushes anything itself: every crash-visible write is
//! followed by a [`Media::persist`] call on the range it touched. That keeps
//! the commit protocol independent of the hardware and lets tests swap in
//! [`MemMedia`], which only keeps what was explicitly persisted.

use std::{
  fs::{self, File, OpenOptions},
  path::{Path, PathBuf},
};

use fs2::FileExt as _;
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error};

use crate::{
  error::{Error, Result},
  layout::{self, CHUNK_SIZE, CLUMP_OFFSET, HDR_OFFSET, rounddown},
};

/// A byte region holding a pool image.
pub trait Media: Send {
  fn bytes(&self) -> &[u8];

  fn bytes_mut(&mut self) -> &mut [u8];

  /// Makes `[off, off + len)` durable and orders it before any later write.
  fn persist(&mut self, off: usize, len: usize);
}

// =============================================================================
// Platform
// =============================================================================

/// How a [`MappedFile`] makes a range durable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushMode {
  /// Flush every covering cache line, then store-fence. Needs byte-addressable
  /// persistent memory behind the mapping (DAX). Falls back to `Msync` on
  /// targets without cache-line flush instructions.
  #[default]
  CacheLine,
  /// `msync(MS_SYNC)` the covering pages. Works on ordinary block storage.
  Msync,
}

#[cfg(all(target_arch = "x86_64", not(feature = "clflushopt")))]
#[inline]
fn flush_line(line: usize) {
  unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) }
}

// Weakly ordered; the trailing sfence orders it.
#[cfg(all(target_arch = "x86_64", feature = "clflushopt"))]
#[inline]
fn flush_line(line: usize) {
  unsafe {
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    core::arch::asm!("clflushopt [{}]", in(reg) line, options(nostack, preserves_flags));
  }
}

/// Flushes every cache line covering `[addr, addr + len)` and fences.
#[cfg(target_arch = "x86_64")]
fn flush_cache_lines(addr: *const u8, len: usize) -> bool {
  let end = addr as usize + len;
  let mut line = rounddown(addr as usize, CHUNK_SIZE);
  while line < end {
    flush_line(line);
    line += CHUNK_SIZE;
  }
  unsafe { core::arch::x86_64::_mm_sfence() };
  true
}

#[cfg(not(target_arch = "x86_64"))]
fn flush_cache_lines(_addr: *const u8, _len: usize) -> bool {
  false
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
  use std::os::fd::AsRawFd;

  // posix_fallocate reports failure through its return value, not errno.
  let err = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
  if err != 0 {
    return Err(std::io::Error::from_raw_os_error(err));
  }
  Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
  file.set_len(size)
}

// =============================================================================
// Mapped file
// =============================================================================

/// A pool file mapped shared and read-write, exclusively locked while open.
pub struct MappedFile {
  mmap: MmapMut,
  file: File,
  path: PathBuf,
  flush: FlushMode,
}

impl MappedFile {
  /// Creates a new zero-filled pool file of `size` bytes laid out as an
  /// empty pool. Fails if the file already exists.
  pub fn create(path: impl AsRef<Path>, size: u64, flush: FlushMode) -> Result<Self> {
    use std::os::unix::fs::FileExt as _;

    let path = path.as_ref().to_path_buf();
    layout::check_size(size)?;
    let total = usize::try_from(size).map_err(|_| Error::InvalidSize {
      size,
      min: layout::MIN_POOL_SIZE as u64,
    })?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create_new(true)
      .open(&path)
      .map_err(|e| Error::io(&path, e))?;

    // The block chain is synced before the header, so a crash mid-creation
    // leaves a file without a signature rather than a signed empty chain.
    let init = || -> std::io::Result<()> {
      file.try_lock_exclusive()?;
      preallocate(&file, size)?;
      file.write_all_at(&layout::initial_clump(total), CLUMP_OFFSET as u64)?;
      let end = layout::sentinel_offset(total);
      file.write_all_at(&layout::sentinel_clump(total), end as u64)?;
      file.sync_all()?;
      file.write_all_at(&layout::header_bytes(total), HDR_OFFSET as u64)?;
      file.sync_all()
    };
    if let Err(e) = init() {
      let _ = fs::remove_file(&path);
      return Err(Error::io(&path, e));
    }
    debug!(path = %path.display(), size, "created pool file");

    Self::map(file, path, total, flush)
  }

  /// Opens an existing pool file at its current size.
  pub fn open(path: impl AsRef<Path>, flush: FlushMode) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .open(&path)
      .map_err(|e| Error::io(&path, e))?;
    file.try_lock_exclusive().map_err(|e| Error::io(&path, e))?;

    let size = file.metadata().map_err(|e| Error::io(&path, e))?.len();
    layout::check_size(size)?;
    let total = usize::try_from(size).map_err(|_| Error::InvalidSize {
      size,
      min: layout::MIN_POOL_SIZE as u64,
    })?;

    Self::map(file, path, total, flush)
  }

  fn map(file: File, path: PathBuf, len: usize, flush: FlushMode) -> Result<Self> {
    let mmap = unsafe {
      MmapOptions::new()
        .len(len)
        .populate()
        .map_mut(&file)
        .map_err(|e| Error::io(&path, e))?
    };
    Ok(Self {
      mmap,
      file,
      path,
      flush,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn flush_mode(&self) -> FlushMode {
    self.flush
  }

  fn msync(&self, off: usize, len: usize) {
    if let Err(e) = self.mmap.flush_range(off, len) {
      error!(path = %self.path.display(), off, len, error = %e, "msync failed");
    }
  }
}

impl Media for MappedFile {
  #[inline]
  fn bytes(&self) -> &[u8] {
    &self.mmap
  }

  #[inline]
  fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.mmap
  }

  fn persist(&mut self, off: usize, len: usize) {
    let len = len.min(self.mmap.len().saturating_sub(off));
    if len == 0 {
      return;
    }
    match self.flush {
      FlushMode::CacheLine => {
        let addr = unsafe { self.mmap.as_ptr().add(off) };
        if !flush_cache_lines(addr, len) {
          self.msync(off, len);
        }
      }
      FlushMode::Msync => self.msync(off, len),
    }
  }
}

impl Drop for MappedFile {
  fn drop(&mut self) {
    let _ = fs2::FileExt::unlock(&self.file);
  }
}

// =============================================================================
// In-memory media
// =============================================================================

/// Pool image held in memory, with an explicit durable copy.
///
/// Stores land in the volatile image only. `persist` copies the covering
/// cache lines into the durable image, which is what a crash preserves.
/// A persist budget freezes the durable image after a given number of
/// persists, simulating a crash at that instruction boundary.
#[derive(Clone, Debug)]
pub struct MemMedia {
  volatile: Vec<u8>,
  durable: Vec<u8>,
  log: Vec<(usize, usize)>,
  budget: Option<usize>,
}

impl MemMedia {
  /// A formatted, empty pool of `size` bytes.
  pub fn create(size: usize) -> Result<Self> {
    let mut image = vec![0u8; size];
    layout::format(&mut image)?;
    Ok(Self::from_image(image))
  }

  /// Wraps an existing image, treating all of it as durable.
  pub fn from_image(image: Vec<u8>) -> Self {
    Self {
      durable: image.clone(),
      volatile: image,
      log: Vec::new(),
      budget: None,
    }
  }

  /// Lets `n` more persists take effect, then drops all later ones.
  pub fn crash_after(&mut self, n: usize) {
    self.budget = Some(n);
  }

  /// Number of persists issued so far, including dropped ones.
  pub fn persists(&self) -> usize {
    self.log.len()
  }

  /// Ordered `(offset, len)` of every persist issued.
  pub fn persist_log(&self) -> &[(usize, usize)] {
    &self.log
  }

  /// What survives power loss right now, as a fresh media.
  pub fn crash(&self) -> MemMedia {
    Self::from_image(self.durable.clone())
  }

  pub fn durable_image(&self) -> &[u8] {
    &self.durable
  }
}

impl Media for MemMedia {
  #[inline]
  fn bytes(&self) -> &[u8] {
    &self.volatile
  }

  #[inline]
  fn bytes_mut(&mut self) -> &mut [u8] {
    &mut self.volatile
  }

  fn persist(&mut self, off: usize, len: usize) {
    self.log.push((off, len));
    match self.budget {
      Some(0) => return,
      Some(ref mut left) => *left -= 1,
      None => {}
    }
    let start = rounddown(off, CHUNK_SIZE);
    let end = layout::align_up(off + len, CHUNK_SIZE).min(self.volatile.len());
    if start < end {
      self.durable[start..end].copy_from_slice(&self.volatile[start..end]);
    }
  }
}
