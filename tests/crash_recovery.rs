//! Crash at every persist boundary of each mutating operation, then reopen.

mod common;

use pmalloc::{CHUNK_SIZE, Media, MemMedia, Pool, RelPtr, State};

use common::{arm_crash, count, crash_and_reopen, root, small_pool};

const ALLOCATABLE: u64 = 1_032_128;

/// Persists issued by `op`, measured on a scratch copy of the pool.
fn persists_of(
  setup: impl Fn() -> (Pool<MemMedia>, RelPtr),
  op: impl Fn(&Pool<MemMedia>, RelPtr),
) -> usize {
  let (pool, ptr) = setup();
  let before = pool.with_media(|m| m.persists());
  op(&pool, ptr);
  pool.with_media(|m| m.persists()) - before
}

fn reserved_with_two_roots() -> (Pool<MemMedia>, RelPtr) {
  let pool = small_pool();
  let ptr = pool.reserve(64).unwrap();
  pool.write(ptr, &[0xAB; 64]).unwrap();
  pool.onactive(ptr, root(&pool, 0), ptr.get()).unwrap();
  pool.onactive(ptr, root(&pool, 1), ptr.get() + 1).unwrap();
  (pool, ptr)
}

fn active_with_onfree() -> (Pool<MemMedia>, RelPtr) {
  let pool = small_pool();
  let ptr = pool.reserve(64).unwrap();
  pool.onactive(ptr, root(&pool, 0), ptr.get()).unwrap();
  pool.activate(ptr).unwrap();
  pool.onfree(ptr, root(&pool, 0), 0).unwrap();
  (pool, ptr)
}

#[test]
fn activate_persists_in_commit_order() {
  let (pool, ptr) = reserved_with_two_roots();
  let start = pool.with_media(|m| m.persists());
  pool.activate(ptr).unwrap();

  let header = ptr.get() as usize - CHUNK_SIZE;
  let r0 = root(&pool, 0).get() as usize;
  let r1 = root(&pool, 1).get() as usize;
  let log = pool.with_media(|m| m.persist_log()[start..].to_vec());
  assert_eq!(log, vec![
    (ptr.get() as usize, 64),
    (header, CHUNK_SIZE),
    (r0, 8),
    (r1, 8),
    (header, CHUNK_SIZE),
    (header, CHUNK_SIZE),
  ]);
}

#[test]
fn activate_is_all_or_nothing() {
  let total = persists_of(reserved_with_two_roots, |pool, ptr| pool.activate(ptr).unwrap());
  assert_eq!(total, 6);

  for k in 0..=total {
    let (pool, ptr) = reserved_with_two_roots();
    arm_crash(&pool, k);
    pool.activate(ptr).unwrap();
    let after = crash_and_reopen(&pool);

    let r0 = after.read_u64(root(&after, 0)).unwrap();
    let r1 = after.read_u64(root(&after, 1)).unwrap();
    // The second persist is the ACTIVATING commit point.
    if k < 2 {
      assert_eq!(count(&after, State::Active), 0, "crash after {k}");
      assert_eq!((r0, r1), (0, 0), "crash after {k}");
      assert_eq!(after.recovery().reclaimed, 1);
    } else {
      assert_eq!(count(&after, State::Active), 1, "crash after {k}");
      assert_eq!((r0, r1), (ptr.get(), ptr.get() + 1), "crash after {k}");
      let mut payload = [0u8; 64];
      after.read(ptr, &mut payload).unwrap();
      assert_eq!(payload, [0xAB; 64]);
      assert_eq!(after.recovery().activated, usize::from(k < total));
    }
    assert_eq!(after.stats().unwrap().deferred, 0);
    after.validate().unwrap();
  }
}

#[test]
fn free_is_all_or_nothing() {
  let total = persists_of(active_with_onfree, |pool, ptr| pool.free(ptr).unwrap());
  assert_eq!(total, 4);

  for k in 0..=total {
    let (pool, ptr) = active_with_onfree();
    arm_crash(&pool, k);
    pool.free(ptr).unwrap();
    let after = crash_and_reopen(&pool);

    let r0 = after.read_u64(root(&after, 0)).unwrap();
    if k == 0 {
      assert_eq!(count(&after, State::Active), 1, "crash after {k}");
      assert_eq!(r0, ptr.get());
      // The pending onfree entry is still registered.
      assert_eq!(after.stats().unwrap().deferred, 1);
    } else {
      assert_eq!(count(&after, State::Active), 0, "crash after {k}");
      assert_eq!(r0, 0, "crash after {k}");
      assert_eq!(after.stats().unwrap().get(State::Free).bytes, ALLOCATABLE);
    }
    after.validate().unwrap();
  }
}

#[test]
fn interrupted_reservation_is_reclaimed() {
  let total = persists_of(
    || (small_pool(), RelPtr::NULL),
    |pool, _| {
      pool.reserve(64).unwrap();
    },
  );
  assert_eq!(total, 4);

  for k in 0..=total {
    let pool = small_pool();
    arm_crash(&pool, k);
    pool.reserve(64).unwrap();
    let after = crash_and_reopen(&pool);

    after.validate().unwrap();
    let stats = after.stats().unwrap();
    assert_eq!(stats.get(State::Free).count, 1, "crash after {k}");
    assert_eq!(stats.get(State::Free).bytes, ALLOCATABLE);
    // Split written but not yet claimed: the sentinel points at the tail.
    let report = after.recovery();
    assert_eq!(report.relinked, usize::from(k == 2 || k == 3), "crash after {k}");
    assert_eq!(report.reclaimed, usize::from(k == 4), "crash after {k}");
  }
}

#[test]
fn interrupted_merge_is_healed() {
  let setup = || {
    let pool = small_pool();
    let ptrs: Vec<_> = (0..3).map(|_| pool.reserve(64).unwrap()).collect();
    for &p in &ptrs {
      pool.activate(p).unwrap();
    }
    pool.free(ptrs[0]).unwrap();
    pool.free(ptrs[1]).unwrap();
    (pool, ptrs[0])
  };
  let total = persists_of(setup, |pool, _| {
    assert_eq!(pool.coalesce().unwrap(), 1);
  });
  assert_eq!(total, 2);

  for k in 0..=total {
    let (pool, first) = setup();
    arm_crash(&pool, k);
    pool.coalesce().unwrap();
    let after = crash_and_reopen(&pool);

    after.validate().unwrap();
    assert_eq!(after.usable_size(first).unwrap(), 256 - CHUNK_SIZE);
    assert_eq!(count(&after, State::Active), 1);
    assert_eq!(after.recovery().relinked, usize::from(k == 1), "crash after {k}");
  }
}

#[test]
fn durable_image_matches_after_every_operation() {
  let pool = small_pool();
  let a = pool.reserve(300).unwrap();
  pool.onactive(a, root(&pool, 0), a.get()).unwrap();
  pool.activate(a).unwrap();
  let b = pool.reserve(10).unwrap();
  pool.cancel(b).unwrap();
  pool.onfree(a, root(&pool, 0), 0).unwrap();
  pool.free(a).unwrap();
  pool.coalesce().unwrap();

  // Every allocator write was persisted, so nothing is lost on power loss.
  let (volatile, durable) = pool.with_media(|m| (m.bytes().to_vec(), m.durable_image().to_vec()));
  assert!(volatile == durable);
}
