use core::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Size of each fixed page preceding the block chain.
pub const PAGE_SIZE: usize = 4096;

/// Offset 0 is never handed out, so a zero relative pointer means "none".
pub const NULL_OFFSET: usize = 0;
/// Static root area: caller-owned entry points into durable structures.
pub const STATIC_OFFSET: usize = PAGE_SIZE;
pub const STATIC_SIZE: usize = PAGE_SIZE;
/// Guard page between the static area and the pool header.
pub const RED_OFFSET: usize = 2 * PAGE_SIZE;
/// Pool header: signature + total size.
pub const HDR_OFFSET: usize = 3 * PAGE_SIZE;
/// First block of the chain.
pub const CLUMP_OFFSET: usize = 4 * PAGE_SIZE;

pub const MIN_POOL_SIZE: usize = 1024 * 1024;

/// Allocation granularity, block header length and persistence unit.
pub const CHUNK_SIZE: usize = 64;
/// Low bits of the size word hold the block state.
pub(crate) const STATE_MASK: u64 = (CHUNK_SIZE - 1) as u64;

/// Deferred pointer writes a block can carry.
pub const NUM_ON: usize = 3;

/// Number of `u64` root slots in the static area.
pub const STATIC_SLOTS: usize = STATIC_SIZE / 8;

pub(crate) const SIGNATURE: [u8; 16] = *b"*PMEMALLOC_POOL\0";
const SIGNATURE_FIELD: usize = HDR_OFFSET;
const TOTALSIZE_FIELD: usize = HDR_OFFSET + SIGNATURE.len();

// Block header field offsets, relative to the block start.
pub(crate) const SIZE_FIELD: usize = 0;
pub(crate) const PREVSIZE_FIELD: usize = 8;
const ON_FIELD: usize = 16;
const ON_ENTRY_SIZE: usize = 16;

#[inline(always)]
pub(crate) const fn on_dest_field(slot: usize) -> usize {
  ON_FIELD + slot * ON_ENTRY_SIZE
}

#[inline(always)]
pub(crate) const fn on_value_field(slot: usize) -> usize {
  ON_FIELD + slot * ON_ENTRY_SIZE + 8
}

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(CHUNK_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE % CHUNK_SIZE == 0);
const _: () = assert!(on_value_field(NUM_ON - 1) + 8 == CHUNK_SIZE);
const _: () = assert!(STATIC_OFFSET + STATIC_SIZE == RED_OFFSET);
const _: () = assert!(RED_OFFSET + PAGE_SIZE == HDR_OFFSET);
const _: () = assert!(HDR_OFFSET + PAGE_SIZE == CLUMP_OFFSET);
const _: () = assert!(TOTALSIZE_FIELD + 8 <= CLUMP_OFFSET);
const _: () = assert!(MIN_POOL_SIZE > CLUMP_OFFSET + 4 * CHUNK_SIZE);
const _: () = assert!(NULL_OFFSET < STATIC_OFFSET);

// =============================================================================
// Relative pointers
// =============================================================================

/// Offset from the pool base.
///
/// Every pointer stored inside the pool is relative, because the mapping
/// base differs from one run to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPtr(u64);

impl RelPtr {
  pub const NULL: RelPtr = RelPtr(NULL_OFFSET as u64);

  #[inline(always)]
  pub const fn new(offset: u64) -> Self {
    Self(offset)
  }

  #[inline(always)]
  pub const fn get(self) -> u64 {
    self.0
  }

  #[inline(always)]
  pub const fn is_null(self) -> bool {
    self.0 == NULL_OFFSET as u64
  }

  #[inline(always)]
  pub const fn add(self, bytes: u64) -> Self {
    Self(self.0 + bytes)
  }

  #[inline(always)]
  pub(crate) const fn offset(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for RelPtr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

// =============================================================================
// Codec
// =============================================================================

#[inline]
pub(crate) fn read_u64(bytes: &[u8], off: usize) -> Result<u64> {
  bytes
    .get(off..off + 8)
    .map(LittleEndian::read_u64)
    .ok_or(Error::OutOfBounds {
      offset: RelPtr::new(off as u64),
      len: 8,
    })
}

#[inline]
pub(crate) fn write_u64(bytes: &mut [u8], off: usize, value: u64) -> Result<()> {
  let word = bytes.get_mut(off..off + 8).ok_or(Error::OutOfBounds {
    offset: RelPtr::new(off as u64),
    len: 8,
  })?;
  LittleEndian::write_u64(word, value);
  Ok(())
}

// =============================================================================
// Pool geometry
// =============================================================================

/// Offset of the zero-sized block terminating the chain.
#[inline(always)]
pub(crate) const fn sentinel_offset(total: usize) -> usize {
  rounddown(total, CHUNK_SIZE) - CHUNK_SIZE
}

/// Bytes covered by the block chain, sentinel excluded.
#[inline(always)]
pub(crate) const fn chain_bytes(total: usize) -> usize {
  sentinel_offset(total) - CLUMP_OFFSET
}

/// Header of the single free block that covers a freshly created pool.
pub(crate) fn initial_clump(total: usize) -> [u8; CHUNK_SIZE] {
  let mut clump = [0u8; CHUNK_SIZE];
  LittleEndian::write_u64(&mut clump[SIZE_FIELD..], chain_bytes(total) as u64);
  clump
}

/// Terminating block of a freshly created pool, linked back to the first.
pub(crate) fn sentinel_clump(total: usize) -> [u8; CHUNK_SIZE] {
  let mut clump = [0u8; CHUNK_SIZE];
  LittleEndian::write_u64(&mut clump[PREVSIZE_FIELD..], chain_bytes(total) as u64);
  clump
}

/// Signature and total size, as stored at `HDR_OFFSET`.
pub(crate) fn header_bytes(total: usize) -> [u8; 24] {
  let mut hdr = [0u8; 24];
  hdr[..SIGNATURE.len()].copy_from_slice(&SIGNATURE);
  LittleEndian::write_u64(&mut hdr[SIGNATURE.len()..], total as u64);
  hdr
}

/// Writes the layout of an empty pool into zero-filled `bytes`.
pub(crate) fn format(bytes: &mut [u8]) -> Result<()> {
  let total = bytes.len();
  check_size(total as u64)?;
  bytes[CLUMP_OFFSET..CLUMP_OFFSET + CHUNK_SIZE].copy_from_slice(&initial_clump(total));
  let end = sentinel_offset(total);
  bytes[end..end + CHUNK_SIZE].copy_from_slice(&sentinel_clump(total));
  bytes[HDR_OFFSET..HDR_OFFSET + 24].copy_from_slice(&header_bytes(total));
  Ok(())
}

pub(crate) fn check_size(size: u64) -> Result<()> {
  if size < MIN_POOL_SIZE as u64 {
    return Err(Error::InvalidSize {
      size,
      min: MIN_POOL_SIZE as u64,
    });
  }
  Ok(())
}

/// Validates the header page against the mapped length.
pub(crate) fn verify_header(bytes: &[u8]) -> Result<()> {
  check_size(bytes.len() as u64)?;
  if bytes[SIGNATURE_FIELD..SIGNATURE_FIELD + SIGNATURE.len()] != SIGNATURE {
    return Err(Error::BadSignature {
      cause: "signature mismatch",
    });
  }
  if read_u64(bytes, TOTALSIZE_FIELD)? != bytes.len() as u64 {
    return Err(Error::BadSignature {
      cause: "recorded size differs from file size",
    });
  }
  Ok(())
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn rounddown(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn geometry_of_a_one_mib_pool() {
    assert_eq!(sentinel_offset(MIN_POOL_SIZE), MIN_POOL_SIZE - CHUNK_SIZE);
    assert_eq!(chain_bytes(MIN_POOL_SIZE), 1_032_128);
    // Trailing bytes past the last full chunk are never used.
    assert_eq!(sentinel_offset(MIN_POOL_SIZE + 63), MIN_POOL_SIZE - CHUNK_SIZE);
    assert_eq!(sentinel_offset(MIN_POOL_SIZE + 64), MIN_POOL_SIZE);
  }

  #[test]
  fn align_helpers() {
    assert_eq!(align_up(0, 64), 0);
    assert_eq!(align_up(1, 64), 64);
    assert_eq!(align_up(64, 64), 64);
    assert_eq!(align_up(65, 64), 128);
    assert_eq!(rounddown(127, 64), 64);
  }

  #[test]
  fn codec_is_bounds_checked() {
    let mut buf = [0u8; 16];
    write_u64(&mut buf, 8, 0xDEAD_BEEF).unwrap();
    assert_eq!(read_u64(&buf, 8).unwrap(), 0xDEAD_BEEF);
    assert!(read_u64(&buf, 9).is_err());
    assert!(matches!(
      write_u64(&mut buf, 12, 1),
      Err(Error::OutOfBounds { len: 8, .. })
    ));
  }

  #[test]
  fn formatted_image_passes_header_checks() {
    let mut bytes = vec![0u8; MIN_POOL_SIZE];
    format(&mut bytes).unwrap();
    verify_header(&bytes).unwrap();
    assert_eq!(
      read_u64(&bytes, CLUMP_OFFSET).unwrap(),
      chain_bytes(MIN_POOL_SIZE) as u64
    );
    let end = sentinel_offset(MIN_POOL_SIZE);
    assert_eq!(read_u64(&bytes, end).unwrap(), 0);
    assert_eq!(
      read_u64(&bytes, end + PREVSIZE_FIELD).unwrap(),
      chain_bytes(MIN_POOL_SIZE) as u64
    );

    bytes[HDR_OFFSET] = b'#';
    assert!(matches!(
      verify_header(&bytes),
      Err(Error::BadSignature { .. })
    ));
  }

  #[test]
  fn recorded_size_must_match() {
    let mut bytes = vec![0u8; MIN_POOL_SIZE];
    format(&mut bytes).unwrap();
    bytes.extend_from_slice(&[0u8; PAGE_SIZE]);
    assert!(matches!(
      verify_header(&bytes),
      Err(Error::BadSignature { .. })
    ));
  }

  #[test]
  fn small_images_are_rejected() {
    let mut bytes = vec![0u8; MIN_POOL_SIZE - 1];
    assert!(matches!(format(&mut bytes), Err(Error::InvalidSize { .. })));
  }

  #[test]
  fn rel_ptr_formats_as_hex() {
    assert_eq!(RelPtr::new(0x4040).to_string(), "0x4040");
    assert!(RelPtr::NULL.is_null());
    assert_eq!(RelPtr::new(8).add(8), RelPtr::new(16));
  }
}
