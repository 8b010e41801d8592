//! Block chain engine: first-fit reservation, the commit protocol for
//! activation and release, crash recovery and coalescing.
//!
//! Every method here runs with the pool lock held. Each crash-visible store
//! is followed by a persist of the cache line it landed in before the next
//! dependent store; the ordering comments below name the commit points.

use tracing::{debug, error, info, warn};

use crate::{
  check::{self, CheckReport},
  clump::{Chain, Clump, State, pack, walk},
  error::{Error, Result},
  layout::{
    self, CHUNK_SIZE, CLUMP_OFFSET, NUM_ON, PREVSIZE_FIELD, RelPtr, SIZE_FIELD, STATIC_OFFSET,
    STATIC_SIZE, on_dest_field, on_value_field,
  },
  media::Media,
};

/// What the recovery scan had to resolve at pool open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
  /// Abandoned reservations returned to the free pool.
  pub reclaimed: usize,
  /// Interrupted activations rolled forward to active.
  pub activated: usize,
  /// Interrupted releases rolled forward to free.
  pub released: usize,
  /// Back-links (`prevsize`) rewritten to match the chain.
  pub relinked: usize,
}

impl RecoveryReport {
  pub fn is_clean(&self) -> bool {
    *self == Self::default()
  }
}

/// Block size needed to hold `size` payload bytes.
#[inline]
pub(crate) fn request_size(size: usize) -> Option<usize> {
  let payload = size.max(1).checked_add(CHUNK_SIZE - 1)? & !(CHUNK_SIZE - 1);
  payload.checked_add(CHUNK_SIZE)
}

pub(crate) struct Heap<M> {
  media: M,
  /// Offset of the sentinel.
  end: usize,
  /// Block of the last successful reservation; scans start here.
  cursor: usize,
}

impl<M: Media> Heap<M> {
  pub(crate) fn attach(media: M) -> Result<Self> {
    layout::verify_header(media.bytes())?;
    let end = layout::sentinel_offset(media.bytes().len());
    Ok(Self {
      media,
      end,
      cursor: CLUMP_OFFSET,
    })
  }

  pub(crate) fn media(&self) -> &M {
    &self.media
  }

  pub(crate) fn media_mut(&mut self) -> &mut M {
    &mut self.media
  }

  pub(crate) fn into_media(self) -> M {
    self.media
  }

  // ===========================================================================
  // Raw access
  // ===========================================================================

  #[inline]
  fn clump(&self, off: usize) -> Result<Clump> {
    walk(self.media.bytes(), off, self.end)
  }

  #[inline]
  fn store(&mut self, off: usize, value: u64) -> Result<()> {
    layout::write_u64(self.media.bytes_mut(), off, value)
  }

  #[inline]
  fn persist_header(&mut self, off: usize) {
    self.media.persist(off, CHUNK_SIZE);
  }

  fn set_state(&mut self, off: usize, size: usize, state: State) -> Result<()> {
    self.store(off + SIZE_FIELD, pack(size, state))?;
    self.persist_header(off);
    Ok(())
  }

  fn set_prevsize(&mut self, off: usize, prevsize: usize) -> Result<()> {
    self.store(off + PREVSIZE_FIELD, prevsize as u64)?;
    self.persist_header(off);
    Ok(())
  }

  /// Clears slots last to first, so a torn clear still leaves a prefix.
  fn clear_on_list(&mut self, off: usize) -> Result<()> {
    for slot in (0..NUM_ON).rev() {
      self.store(off + on_dest_field(slot), 0)?;
      self.store(off + on_value_field(slot), 0)?;
    }
    self.persist_header(off);
    Ok(())
  }

  /// Performs every deferred write of `clump`. Idempotent.
  fn apply_on_list(&mut self, clump: &Clump) -> Result<()> {
    for entry in clump.on.pending() {
      self.store(entry.dest.offset(), entry.value)?;
      self.media.persist(entry.dest.offset(), 8);
      debug!(block = %RelPtr::new(clump.off as u64), dest = %entry.dest, value = entry.value, "applied deferred write");
    }
    Ok(())
  }

  /// Block whose payload starts at `ptr`.
  pub(crate) fn block_of(&self, ptr: RelPtr) -> Result<Clump> {
    let p = ptr.offset();
    if p < CLUMP_OFFSET + CHUNK_SIZE || p >= self.end || p % CHUNK_SIZE != 0 {
      return Err(Error::OutOfBounds { offset: ptr, len: 0 });
    }
    let off = p - CHUNK_SIZE;
    let clump = self.clump(off)?;
    if clump.is_sentinel() {
      return Err(Error::OutOfBounds { offset: ptr, len: 0 });
    }
    Ok(clump)
  }

  fn expect_state(&self, clump: &Clump, expected: State) -> Result<()> {
    if clump.state == expected {
      return Ok(());
    }
    error!(
      block = %RelPtr::new(clump.off as u64),
      found = %clump.state,
      expected = %expected,
      "allocation protocol violation"
    );
    Err(Error::ProtocolViolation {
      offset: clump.payload(),
      found: clump.state,
      expected,
    })
  }

  /// Block whose extent covers `off`, which must lie inside the chain.
  fn block_containing(&self, off: usize) -> Result<Clump> {
    for clump in Chain::new(self.media.bytes(), CLUMP_OFFSET, self.end) {
      let clump = clump?;
      if off < clump.next() {
        return Ok(clump);
      }
    }
    Err(Error::corrupt(off, "offset is past the last block"))
  }

  /// Deferred writes may target the static area or any payload byte, but
  /// never the fixed pages or a block header.
  fn check_dest(&self, dest: RelPtr) -> Result<()> {
    let d = dest.offset();
    if d % 8 != 0 {
      return Err(Error::Misaligned { offset: dest });
    }
    if (STATIC_OFFSET..STATIC_OFFSET + STATIC_SIZE).contains(&d) {
      return Ok(());
    }
    let out = Error::OutOfBounds { offset: dest, len: 8 };
    if !(CLUMP_OFFSET..self.end).contains(&d) {
      return Err(out);
    }
    if d < self.block_containing(d)?.payload().offset() {
      return Err(out);
    }
    Ok(())
  }

  /// Splits since registration can put a header under a destination, so
  /// every entry is checked again before a commit point.
  fn check_pending(&self, clump: &Clump) -> Result<()> {
    for entry in clump.on.pending() {
      self.check_dest(entry.dest)?;
    }
    Ok(())
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// First free block of at least `needed` bytes in `[from, until)`.
  fn first_fit(&self, from: usize, until: usize, needed: usize) -> Result<Option<Clump>> {
    for clump in Chain::new(self.media.bytes(), from, self.end) {
      let clump = clump?;
      if clump.off >= until {
        break;
      }
      if clump.state == State::Free && clump.size >= needed {
        return Ok(Some(clump));
      }
    }
    Ok(None)
  }

  /// Rotating first fit: from the cursor to the sentinel, then from the head
  /// back up to the cursor.
  fn find_fit(&self, needed: usize) -> Result<Option<Clump>> {
    if let Some(clump) = self.first_fit(self.cursor, self.end, needed)? {
      return Ok(Some(clump));
    }
    if self.cursor == CLUMP_OFFSET {
      return Ok(None);
    }
    self.first_fit(CLUMP_OFFSET, self.cursor, needed)
  }

  pub(crate) fn reserve(&mut self, size: usize) -> Result<RelPtr> {
    let out_of_space = Error::OutOfSpace {
      requested: size as u64,
    };
    let Some(needed) = request_size(size) else {
      return Err(out_of_space);
    };

    let clump = match self.find_fit(needed)? {
      Some(clump) => clump,
      None => {
        warn!(needed, "no fit found, coalescing and retrying");
        self.coalesce()?;
        match self.find_fit(needed)? {
          Some(clump) => clump,
          None => return Err(out_of_space),
        }
      }
    };

    self.claim(clump, needed)
  }

  /// Turns free `clump` into a reserved block of `needed` bytes, splitting
  /// off the tail when it is at least two granules.
  fn claim(&mut self, clump: Clump, needed: usize) -> Result<RelPtr> {
    let leftover = clump.size - needed;

    if leftover >= 2 * CHUNK_SIZE {
      // The tail is still inside a free block until the size word of `clump`
      // changes, so it can be written first:
      //  1. initialize and persist the new free block
      //  2. point the following block back at it
      //  3. clear and persist the on-list of `clump`
      //  4. shrink `clump` to `needed`, RESERVED, and persist
      let tail = clump.off + needed;
      self.media.bytes_mut()[tail..tail + CHUNK_SIZE].fill(0);
      self.store(tail + SIZE_FIELD, pack(leftover, State::Free))?;
      self.store(tail + PREVSIZE_FIELD, needed as u64)?;
      self.persist_header(tail);
      self.set_prevsize(clump.next(), leftover)?;
      self.clear_on_list(clump.off)?;
      self.set_state(clump.off, needed, State::Reserved)?;
      debug!(block = %RelPtr::new(clump.off as u64), size = needed, leftover, "reserved with split");
    } else {
      self.clear_on_list(clump.off)?;
      self.set_state(clump.off, clump.size, State::Reserved)?;
      debug!(block = %RelPtr::new(clump.off as u64), size = clump.size, "reserved whole block");
    }

    self.cursor = clump.off;
    Ok(clump.payload())
  }

  // ===========================================================================
  // Commit protocol
  // ===========================================================================

  /// Queues `*dest = value` for the next commit of the block at `ptr`, which
  /// must currently be in state `expected`.
  pub(crate) fn register(
    &mut self,
    ptr: RelPtr,
    dest: RelPtr,
    value: u64,
    expected: State,
  ) -> Result<()> {
    let clump = self.block_of(ptr)?;
    self.expect_state(&clump, expected)?;
    self.check_dest(dest)?;
    let slot = clump
      .on
      .free_slot()
      .ok_or(Error::OnListFull { offset: ptr })?;

    // The value must be durable before the destination makes the slot live.
    self.store(clump.off + on_value_field(slot), value)?;
    self.persist_header(clump.off);
    self.store(clump.off + on_dest_field(slot), dest.get())?;
    self.persist_header(clump.off);
    debug!(block = %ptr, slot, dest = %dest, value, "registered deferred write");
    Ok(())
  }

  pub(crate) fn activate(&mut self, ptr: RelPtr) -> Result<()> {
    let clump = self.block_of(ptr)?;
    self.expect_state(&clump, State::Reserved)?;
    self.check_pending(&clump)?;

    //  1. persist the payload
    //  2. ACTIVATING: commit point, recovery now rolls forward
    //  3. run the on-list, persisting each write
    //  4. clear the on-list
    //  5. ACTIVE
    self.media.persist(ptr.offset(), clump.payload_len());
    self.set_state(clump.off, clump.size, State::Activating)?;
    self.apply_on_list(&clump)?;
    self.clear_on_list(clump.off)?;
    self.set_state(clump.off, clump.size, State::Active)?;
    debug!(block = %ptr, size = clump.size, "activated");
    Ok(())
  }

  pub(crate) fn free(&mut self, ptr: RelPtr) -> Result<()> {
    let clump = self.block_of(ptr)?;
    if clump.state == State::Free {
      debug!(block = %ptr, "free of a free block");
      return Ok(());
    }
    self.expect_state(&clump, State::Active)?;
    self.check_pending(&clump)?;

    //  1. FREEING: commit point, recovery now rolls forward
    //  2. run the on-list, persisting each write
    //  3. clear the on-list
    //  4. FREE
    self.set_state(clump.off, clump.size, State::Freeing)?;
    self.apply_on_list(&clump)?;
    self.clear_on_list(clump.off)?;
    self.set_state(clump.off, clump.size, State::Free)?;
    debug!(block = %ptr, size = clump.size, "freed");
    Ok(())
  }

  /// Drops a reservation that will never be activated. Its on-list is
  /// discarded without being applied.
  pub(crate) fn cancel(&mut self, ptr: RelPtr) -> Result<()> {
    let clump = self.block_of(ptr)?;
    self.expect_state(&clump, State::Reserved)?;
    self.clear_on_list(clump.off)?;
    self.set_state(clump.off, clump.size, State::Free)?;
    debug!(block = %ptr, size = clump.size, "reservation cancelled");
    Ok(())
  }

  // ===========================================================================
  // Recovery
  // ===========================================================================

  /// Resolves every block left mid-transition by a crash. Each block's
  /// outcome depends only on its own state word and on-list, so one pass
  /// suffices.
  pub(crate) fn recover(&mut self) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut prev = 0;
    let mut off = CLUMP_OFFSET;

    loop {
      let clump = self.clump(off)?;
      if clump.prevsize != prev {
        self.set_prevsize(off, prev)?;
        report.relinked += 1;
      }
      if clump.is_sentinel() {
        break;
      }

      match clump.state {
        State::Free | State::Active => {}
        State::Reserved => {
          self.clear_on_list(off)?;
          self.set_state(off, clump.size, State::Free)?;
          report.reclaimed += 1;
        }
        State::Activating => {
          self.apply_on_list(&clump)?;
          self.clear_on_list(off)?;
          self.set_state(off, clump.size, State::Active)?;
          report.activated += 1;
        }
        State::Freeing => {
          self.apply_on_list(&clump)?;
          self.clear_on_list(off)?;
          self.set_state(off, clump.size, State::Free)?;
          report.released += 1;
        }
      }
      if !clump.state.is_terminal() {
        debug!(block = %RelPtr::new(off as u64), state = %clump.state, "resolved interrupted block");
      }

      prev = clump.size;
      off = clump.next();
    }

    if report.is_clean() {
      debug!("recovery found nothing to do");
    } else {
      info!(
        reclaimed = report.reclaimed,
        activated = report.activated,
        released = report.released,
        relinked = report.relinked,
        "recovered pool"
      );
    }
    Ok(report)
  }

  // ===========================================================================
  // Coalescing
  // ===========================================================================

  /// Merges every run of adjacent free blocks into its first block.
  /// Returns the number of blocks absorbed.
  pub(crate) fn coalesce(&mut self) -> Result<usize> {
    let mut absorbed = 0;
    // (first block, combined size, blocks in run)
    let mut run: Option<(usize, usize, usize)> = None;
    let mut off = CLUMP_OFFSET;

    loop {
      let clump = self.clump(off)?;
      if !clump.is_sentinel() && clump.state == State::Free {
        run = Some(match run {
          Some((first, total, count)) => (first, total + clump.size, count + 1),
          None => (off, clump.size, 1),
        });
      } else {
        if let Some((first, total, count)) = run.take()
          && count > 1
        {
          self.merge(first, total, off)?;
          absorbed += count - 1;
        }
        if clump.is_sentinel() {
          break;
        }
      }
      off = clump.next();
    }

    if absorbed > 0 {
      debug!(absorbed, "coalesced free blocks");
    }
    Ok(absorbed)
  }

  /// Rewrites `first` to span `total` bytes ending just before `next`.
  /// Absorbed headers become dead bytes the walk never reads again.
  fn merge(&mut self, first: usize, total: usize, next: usize) -> Result<()> {
    self.set_state(first, total, State::Free)?;
    self.set_prevsize(next, total)?;
    if self.cursor > first && self.cursor < first + total {
      self.cursor = first;
    }
    debug!(block = %RelPtr::new(first as u64), size = total, "merged free run");
    Ok(())
  }

  // ===========================================================================
  // Diagnostics
  // ===========================================================================

  /// Checks that back-links agree with the chain and that the walk lands
  /// exactly on the sentinel.
  pub(crate) fn validate(&self) -> Result<()> {
    let mut prev = 0;
    for clump in Chain::new(self.media.bytes(), CLUMP_OFFSET, self.end) {
      let clump = clump?;
      if clump.prevsize != prev {
        return Err(Error::corrupt(
          clump.off,
          format!("prevsize {} but previous block is {prev} bytes", clump.prevsize),
        ));
      }
      prev = clump.size;
    }
    let sentinel = self.clump(self.end)?;
    if sentinel.prevsize != prev {
      return Err(Error::corrupt(self.end, "sentinel back-link is stale"));
    }
    Ok(())
  }

  /// One line per block: offset, size, state, prevsize.
  pub(crate) fn dump(&self) -> Result<String> {
    let blocks = Chain::new(self.media.bytes(), CLUMP_OFFSET, self.end)
      .collect::<Result<Vec<_>>>()?;
    let mut out: String = blocks
      .iter()
      .map(|c| {
        format!(
          "{:#010x} {:>10} {:<10} {:>10}\n",
          c.off, c.size, c.state, c.prevsize
        )
      })
      .collect();
    out.push_str(&format!("{:#010x} {:>10} sentinel\n", self.end, 0));
    Ok(out)
  }

  pub(crate) fn stats(&self) -> Result<CheckReport> {
    check::survey(self.media.bytes())
  }

  /// Payload capacity of the block at `ptr`.
  pub(crate) fn usable_size(&self, ptr: RelPtr) -> Result<usize> {
    Ok(self.block_of(ptr)?.payload_len())
  }

  // ===========================================================================
  // Caller data
  // ===========================================================================

  /// Caller data lives in the static area and block payloads, never in the
  /// fixed pages or past the sentinel.
  fn check_range(&self, ptr: RelPtr, len: usize) -> Result<usize> {
    let off = ptr.offset();
    let out = Error::OutOfBounds {
      offset: ptr,
      len: len as u64,
    };
    let Some(end) = off.checked_add(len) else {
      return Err(out);
    };
    let in_static = off >= STATIC_OFFSET && end <= STATIC_OFFSET + STATIC_SIZE;
    let in_chain = off >= CLUMP_OFFSET && end <= self.end;
    if !(in_static || in_chain) {
      return Err(out);
    }
    Ok(off)
  }

  pub(crate) fn read(&self, ptr: RelPtr, buf: &mut [u8]) -> Result<()> {
    let off = self.check_range(ptr, buf.len())?;
    buf.copy_from_slice(&self.media.bytes()[off..off + buf.len()]);
    Ok(())
  }

  pub(crate) fn write(&mut self, ptr: RelPtr, data: &[u8]) -> Result<()> {
    let off = self.check_range(ptr, data.len())?;
    self.media.bytes_mut()[off..off + data.len()].copy_from_slice(data);
    Ok(())
  }

  pub(crate) fn persist(&mut self, ptr: RelPtr, len: usize) -> Result<()> {
    let off = self.check_range(ptr, len)?;
    self.media.persist(off, len);
    Ok(())
  }
}
