//! On-media block ("clump") header view.
//!
//! ```text
//!   offset  field
//!   ┌─────┬──────────────────────────────┐
//!   │   0 │ size | state   (low 6 bits)  │
//!   │   8 │ prevsize                     │
//!   │  16 │ on[0].dest  |  on[0].value   │
//!   │  32 │ on[1].dest  |  on[1].value   │
//!   │  48 │ on[2].dest  |  on[2].value   │
//!   └─────┴──────────────────────────────┘
//! ```
//!
//! The header is exactly one cache line, so persisting it is one flush.

use core::fmt;

use crate::{
  error::{Error, Result},
  layout::{
    CHUNK_SIZE, NUM_ON, PREVSIZE_FIELD, RelPtr, SIZE_FIELD, STATE_MASK, on_dest_field,
    on_value_field, read_u64,
  },
};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state packed into the low bits of a block's size word.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum State {
  Free = 0,
  Reserved = 1,
  /// Committed towards `Active`; recovery rolls forward.
  Activating = 2,
  Active = 3,
  /// Committed towards `Free`; recovery rolls forward.
  Freeing = 4,
}

impl State {
  pub const ALL: [State; 5] = [
    State::Free,
    State::Reserved,
    State::Activating,
    State::Active,
    State::Freeing,
  ];

  #[inline(always)]
  pub(crate) fn from_bits(bits: u64) -> Option<Self> {
    match bits {
      0 => Some(State::Free),
      1 => Some(State::Reserved),
      2 => Some(State::Activating),
      3 => Some(State::Active),
      4 => Some(State::Freeing),
      _ => None,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      State::Free => "free",
      State::Reserved => "reserved",
      State::Activating => "activating",
      State::Active => "active",
      State::Freeing => "freeing",
    }
  }

  /// `Free` and `Active` need no recovery work.
  pub fn is_terminal(self) -> bool {
    matches!(self, State::Free | State::Active)
  }
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

const _: () = assert!(State::Freeing as u64 <= STATE_MASK);

#[inline(always)]
pub(crate) const fn pack(size: usize, state: State) -> u64 {
  size as u64 | state as u64
}

// =============================================================================
// On-list
// =============================================================================

/// A pointer write deferred until the owning block's next commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct OnEntry {
  pub dest: RelPtr,
  pub value: u64,
}

/// Fixed-capacity list of deferred writes. A slot is in use iff its
/// destination is non-null; slots fill from the front.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct OnList {
  entries: [OnEntry; NUM_ON],
}

impl OnList {
  pub fn pending(&self) -> impl Iterator<Item = OnEntry> + '_ {
    self.entries.iter().copied().take_while(|e| !e.dest.is_null())
  }

  pub fn free_slot(&self) -> Option<usize> {
    self.entries.iter().position(|e| e.dest.is_null())
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.entries.iter().all(|e| e.dest.is_null())
  }
}

// =============================================================================
// Header view
// =============================================================================

/// Decoded copy of one block header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Clump {
  pub off: usize,
  pub size: usize,
  pub state: State,
  pub prevsize: usize,
  pub on: OnList,
}

impl Clump {
  pub fn load(bytes: &[u8], off: usize) -> Result<Self> {
    let word = read_u64(bytes, off + SIZE_FIELD)?;
    let state = State::from_bits(word & STATE_MASK)
      .ok_or_else(|| Error::corrupt(off, format!("unknown block state {}", word & STATE_MASK)))?;
    let size = usize::try_from(word & !STATE_MASK)
      .map_err(|_| Error::corrupt(off, "block size exceeds address space"))?;
    let prevsize = read_u64(bytes, off + PREVSIZE_FIELD)? as usize;

    let mut on = OnList::default();
    for (slot, entry) in on.entries.iter_mut().enumerate() {
      entry.dest = RelPtr::new(read_u64(bytes, off + on_dest_field(slot))?);
      entry.value = read_u64(bytes, off + on_value_field(slot))?;
    }

    Ok(Self {
      off,
      size,
      state,
      prevsize,
      on,
    })
  }

  #[inline(always)]
  pub fn is_sentinel(&self) -> bool {
    self.size == 0
  }

  #[inline(always)]
  pub fn next(&self) -> usize {
    self.off + self.size
  }

  /// Relative address of the first payload byte.
  #[inline(always)]
  pub fn payload(&self) -> RelPtr {
    RelPtr::new((self.off + CHUNK_SIZE) as u64)
  }

  #[inline(always)]
  pub fn payload_len(&self) -> usize {
    self.size - CHUNK_SIZE
  }
}

/// Loads the block at `off` of a chain whose sentinel sits at `end`.
///
/// Rejects headers that would walk past the sentinel or stop before it.
pub(crate) fn walk(bytes: &[u8], off: usize, end: usize) -> Result<Clump> {
  let clump = Clump::load(bytes, off)?;
  if clump.is_sentinel() {
    if off != end {
      return Err(Error::corrupt(
        off,
        format!("chain stopped at {off:#x} instead of {end:#x}"),
      ));
    }
    return Ok(clump);
  }
  if clump.size % CHUNK_SIZE != 0 || clump.size < CHUNK_SIZE {
    return Err(Error::corrupt(off, format!("bad block size {}", clump.size)));
  }
  match off.checked_add(clump.size) {
    Some(next) if next <= end => Ok(clump),
    _ => Err(Error::corrupt(off, "block overruns the sentinel")),
  }
}

/// Read-only walk over every block before the sentinel.
pub(crate) struct Chain<'a> {
  bytes: &'a [u8],
  off: usize,
  end: usize,
  done: bool,
}

impl<'a> Chain<'a> {
  pub fn new(bytes: &'a [u8], start: usize, end: usize) -> Self {
    Self {
      bytes,
      off: start,
      end,
      done: false,
    }
  }
}

impl Iterator for Chain<'_> {
  type Item = Result<Clump>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    match walk(self.bytes, self.off, self.end) {
      Ok(clump) if clump.is_sentinel() => {
        self.done = true;
        None
      }
      Ok(clump) => {
        self.off = clump.next();
        Some(Ok(clump))
      }
      Err(e) => {
        self.done = true;
        Some(Err(e))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::layout::write_u64;

  fn image_with(blocks: &[(usize, State)]) -> (Vec<u8>, usize) {
    let end = blocks.iter().map(|(s, _)| s).sum::<usize>();
    let mut bytes = vec![0u8; end + CHUNK_SIZE];
    let mut off = 0;
    for &(size, state) in blocks {
      write_u64(&mut bytes, off, pack(size, state)).unwrap();
      off += size;
    }
    (bytes, end)
  }

  #[test]
  fn state_word_roundtrips_all_states() {
    for state in State::ALL {
      let word = pack(4096, state);
      assert_eq!(word & !STATE_MASK, 4096);
      assert_eq!(State::from_bits(word & STATE_MASK), Some(state));
    }
    assert_eq!(State::from_bits(5), None);
  }

  #[test]
  fn only_free_and_active_are_terminal() {
    let terminal: Vec<_> = State::ALL.into_iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(terminal, vec![State::Free, State::Active]);
  }

  #[test]
  fn on_list_fills_from_the_front() {
    let mut on = OnList::default();
    assert!(on.is_empty());
    assert_eq!(on.free_slot(), Some(0));

    on.entries[0] = OnEntry {
      dest: RelPtr::new(0x1000),
      value: 7,
    };
    assert_eq!(on.free_slot(), Some(1));
    assert_eq!(on.pending().count(), 1);

    on.entries[1].dest = RelPtr::new(0x1008);
    on.entries[2].dest = RelPtr::new(0x1010);
    assert_eq!(on.free_slot(), None);
    assert_eq!(on.pending().map(|e| e.dest.get()).collect::<Vec<_>>(), vec![
      0x1000, 0x1008, 0x1010
    ]);
  }

  #[test]
  fn load_decodes_on_entries() {
    let (mut bytes, _) = image_with(&[(128, State::Reserved)]);
    write_u64(&mut bytes, PREVSIZE_FIELD, 64).unwrap();
    write_u64(&mut bytes, on_dest_field(0), 0x1000).unwrap();
    write_u64(&mut bytes, on_value_field(0), 42).unwrap();

    let clump = Clump::load(&bytes, 0).unwrap();
    assert_eq!(clump.size, 128);
    assert_eq!(clump.state, State::Reserved);
    assert_eq!(clump.prevsize, 64);
    assert_eq!(clump.payload(), RelPtr::new(64));
    assert_eq!(clump.payload_len(), 64);
    assert_eq!(clump.on.pending().next(), Some(OnEntry {
      dest: RelPtr::new(0x1000),
      value: 42
    }));
  }

  #[test]
  fn unknown_state_is_corruption() {
    let (mut bytes, _) = image_with(&[(128, State::Free)]);
    write_u64(&mut bytes, 0, 128 | 9).unwrap();
    assert!(matches!(Clump::load(&bytes, 0), Err(Error::Corrupt { .. })));
  }

  #[test]
  fn chain_visits_blocks_up_to_the_sentinel() {
    let (bytes, end) = image_with(&[
      (128, State::Active),
      (256, State::Free),
      (64 * 3, State::Reserved),
    ]);
    let sizes: Vec<_> = Chain::new(&bytes, 0, end)
      .map(|c| c.map(|c| (c.size, c.state)))
      .collect::<Result<_>>()
      .unwrap();
    assert_eq!(sizes, vec![
      (128, State::Active),
      (256, State::Free),
      (192, State::Reserved)
    ]);
  }

  #[test]
  fn chain_reports_early_stop_and_overrun() {
    let (bytes, end) = image_with(&[(128, State::Active), (128, State::Free)]);
    let early = Chain::new(&bytes, 0, end + CHUNK_SIZE).last().unwrap();
    assert!(matches!(early, Err(Error::Corrupt { .. })));

    let overrun = Chain::new(&bytes, 0, end - CHUNK_SIZE).last().unwrap();
    assert!(matches!(overrun, Err(Error::Corrupt { .. })));
  }
}
