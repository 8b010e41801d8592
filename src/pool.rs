//! Public pool handle.

use std::{io, path::Path};

use tracing::info;

use crate::{
  check::CheckReport,
  clump::State,
  error::{Error, Result},
  heap::{Heap, RecoveryReport},
  layout::{MIN_POOL_SIZE, RelPtr, STATIC_OFFSET, STATIC_SLOTS},
  lock::SpinLock,
  media::{FlushMode, MappedFile, Media, MemMedia},
};

// =============================================================================
// Config
// =============================================================================

/// How to create or open a pool file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
  /// Size of a newly created pool. Ignored when the file already exists.
  pub size: u64,
  pub flush: FlushMode,
}

impl PoolConfig {
  pub fn new(size: u64) -> Self {
    Self {
      size,
      flush: FlushMode::default(),
    }
  }

  pub fn with_flush(mut self, flush: FlushMode) -> Self {
    self.flush = flush;
    self
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self::new(MIN_POOL_SIZE as u64)
  }
}

// =============================================================================
// Pool
// =============================================================================

/// An open persistent pool.
///
/// Every operation takes the pool-wide lock for its whole duration, so a
/// `Pool` can be shared between threads behind an `Arc`.
pub struct Pool<M: Media = MappedFile> {
  heap: SpinLock<Heap<M>>,
  /// Start of the mapping in this process, for `abs`/`rel`.
  base: usize,
  len: usize,
  recovery: RecoveryReport,
}

impl Pool<MappedFile> {
  /// Opens the pool at `path`, creating it with `config.size` bytes if the
  /// file does not exist yet.
  pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
    let path = path.as_ref();
    let media = match path.metadata() {
      Ok(_) => MappedFile::open(path, config.flush)?,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        let media = MappedFile::create(path, config.size, config.flush)?;
        info!(path = %path.display(), size = config.size, "created pool");
        media
      }
      Err(e) => return Err(Error::io(path, e)),
    };
    let pool = Self::from_media(media)?;
    info!(path = %path.display(), size = pool.len, "opened pool");
    Ok(pool)
  }
}

impl Pool<MemMedia> {
  /// Runs `f` on the in-memory media with the pool locked, e.g. to arm a
  /// crash budget or take the durable image.
  pub fn with_media<R>(&self, f: impl FnOnce(&mut MemMedia) -> R) -> R {
    f(self.heap.lock().media_mut())
  }
}

impl<M: Media> Pool<M> {
  /// Validates the header, resolves interrupted transitions and merges free
  /// runs.
  pub fn from_media(media: M) -> Result<Self> {
    let mut heap = Heap::attach(media)?;
    let recovery = heap.recover()?;
    heap.coalesce()?;
    tripwire(&heap);

    let bytes = heap.media().bytes();
    let base = bytes.as_ptr() as usize;
    let len = bytes.len();
    Ok(Self {
      heap: SpinLock::new(heap),
      base,
      len,
      recovery,
    })
  }

  /// Total pool size in bytes.
  pub fn size(&self) -> usize {
    self.len
  }

  /// What recovery did when this pool was opened.
  pub fn recovery(&self) -> RecoveryReport {
    self.recovery
  }

  // ===========================================================================
  // Allocation protocol
  // ===========================================================================

  /// Reserves a block with room for at least `size` payload bytes.
  ///
  /// The block stays `Reserved` until [`Pool::activate`]; a crash before
  /// then returns it to the free pool.
  pub fn reserve(&self, size: usize) -> Result<RelPtr> {
    self.mutate(|heap| heap.reserve(size))
  }

  /// On activation of the block at `ptr`, store `value` at `dest`.
  pub fn onactive(&self, ptr: RelPtr, dest: RelPtr, value: u64) -> Result<()> {
    self.mutate(|heap| heap.register(ptr, dest, value, State::Reserved))
  }

  /// On release of the block at `ptr`, store `value` at `dest`.
  pub fn onfree(&self, ptr: RelPtr, dest: RelPtr, value: u64) -> Result<()> {
    self.mutate(|heap| heap.register(ptr, dest, value, State::Active))
  }

  /// Makes a reserved block durable and runs its deferred writes, atomically
  /// with respect to crashes.
  pub fn activate(&self, ptr: RelPtr) -> Result<()> {
    self.mutate(|heap| heap.activate(ptr))
  }

  /// Returns an active block to the free pool and runs its deferred writes.
  /// Freeing a free block is a no-op.
  pub fn free(&self, ptr: RelPtr) -> Result<()> {
    self.mutate(|heap| heap.free(ptr))
  }

  /// Abandons a reservation without running its deferred writes.
  pub fn cancel(&self, ptr: RelPtr) -> Result<()> {
    self.mutate(|heap| heap.cancel(ptr))
  }

  /// Merges adjacent free blocks. Returns the number of blocks absorbed.
  pub fn coalesce(&self) -> Result<usize> {
    self.mutate(|heap| heap.coalesce())
  }

  pub fn usable_size(&self, ptr: RelPtr) -> Result<usize> {
    self.heap.lock().usable_size(ptr)
  }

  // ===========================================================================
  // Caller data
  // ===========================================================================

  pub fn static_area(&self) -> RelPtr {
    RelPtr::new(STATIC_OFFSET as u64)
  }

  /// Root slot `i` of the static area, or `None` past the last slot.
  pub fn root(&self, i: usize) -> Option<RelPtr> {
    (i < STATIC_SLOTS).then(|| self.static_area().add(8 * i as u64))
  }

  pub fn write(&self, ptr: RelPtr, data: &[u8]) -> Result<()> {
    self.heap.lock().write(ptr, data)
  }

  pub fn read(&self, ptr: RelPtr, buf: &mut [u8]) -> Result<()> {
    self.heap.lock().read(ptr, buf)
  }

  pub fn write_u64(&self, ptr: RelPtr, value: u64) -> Result<()> {
    self.write(ptr, &value.to_le_bytes())
  }

  pub fn read_u64(&self, ptr: RelPtr) -> Result<u64> {
    let mut buf = [0u8; 8];
    self.read(ptr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
  }

  /// Makes caller writes to `[ptr, ptr + len)` durable.
  pub fn persist(&self, ptr: RelPtr, len: usize) -> Result<()> {
    self.heap.lock().persist(ptr, len)
  }

  /// Absolute address of `ptr` in this process's mapping.
  ///
  /// Only meaningful while the pool stays open.
  pub fn abs(&self, ptr: RelPtr) -> *const u8 {
    (self.base + ptr.offset()) as *const u8
  }

  /// Pool-relative offset of an address inside the mapping.
  pub fn rel(&self, addr: *const u8) -> Option<RelPtr> {
    let off = (addr as usize).checked_sub(self.base)?;
    (off < self.len).then(|| RelPtr::new(off as u64))
  }

  // ===========================================================================
  // Diagnostics
  // ===========================================================================

  pub fn validate(&self) -> Result<()> {
    self.heap.lock().validate()
  }

  /// Block-by-block listing of the chain.
  pub fn dump(&self) -> Result<String> {
    self.heap.lock().dump()
  }

  pub fn stats(&self) -> Result<CheckReport> {
    self.heap.lock().stats()
  }

  /// Closes the pool and hands back its media.
  pub fn into_media(self) -> M {
    self.heap.into_inner().into_media()
  }

  fn mutate<R>(&self, op: impl FnOnce(&mut Heap<M>) -> Result<R>) -> Result<R> {
    let mut heap = self.heap.lock();
    let out = op(&mut *heap);
    tripwire(&*heap);
    out
  }
}

#[cfg(feature = "debug-tripwire")]
fn tripwire<M: Media>(heap: &Heap<M>) {
  if let Err(e) = heap.validate() {
    panic!("pool chain invalid after mutation: {e}\n{}", heap.dump().unwrap_or_default());
  }
}

#[cfg(not(feature = "debug-tripwire"))]
#[inline(always)]
fn tripwire<M: Media>(_heap: &Heap<M>) {}

impl<M: Media> std::fmt::Debug for Pool<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pool")
      .field("len", &self.len)
      .field("recovery", &self.recovery)
      .finish_non_exhaustive()
  }
}

/// Creates the pool at `path` with `size` bytes, or opens it if it exists.
pub fn pool_init(path: impl AsRef<Path>, size: u64) -> Result<Pool> {
  Pool::open(path, PoolConfig::new(size))
}
