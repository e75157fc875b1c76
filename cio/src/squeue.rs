//! Submission queue adapter.
//!
//! Producers stage 64-byte records behind an internal tail that trails
//! the kernel-visible one; staged entries become visible to the kernel
//! only when a reaper drains them into the index array and publishes
//! the tail with release ordering (`notify`). All mutation happens
//! under the adapter's monitor; producers never enter the kernel.
//!
//! Fullness is judged against the *effective head*: the kernel's head
//! when a SQPOLL thread consumes entries on its own, otherwise the
//! internal head that tracks what has been published. In the
//! non-polled mode `io_uring_enter` consumes every published entry
//! synchronously, so a slot is reusable as soon as it has been
//! published and entered.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cio_uring::params;
use cio_uring::sqe::Sqe;
use cio_uring::{RingHandle, SqView};
use parking_lot::{Mutex, MutexGuard};

use crate::callback::OpCallback;
use crate::error::RingError;
use crate::store::OpStore;
use crate::unblock::Unblock;

/// User-data token: staging fd in the high half, internal tail in the
/// low half. A lookup key, not a globally unique id; the same fd at the
/// same wrapped tail collides, as documented.
pub(crate) fn token(fd: i32, tail: u32) -> u64 {
  ((fd as u32 as u64) << 32) | tail as u64
}

/// Outcome of a submit-and-wait round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submit {
  /// The syscall ran and returned the kernel's count.
  Entered(u32),
  /// Nothing required a syscall.
  Skipped,
  /// EAGAIN/EBUSY: drain completions, then retry.
  AwaitCompletions,
}

/// `io_uring_enter` with the mechanical retry policy applied: EINTR
/// retries in place, EAGAIN/EBUSY ask the caller to drain first, and
/// everything else surfaces.
pub(crate) fn enter_loop(
  ring: &RingHandle,
  to_submit: u32,
  min_complete: u32,
  flags: u32,
) -> Result<Submit, RingError> {
  loop {
    match ring.enter(to_submit, min_complete, flags) {
      Ok(n) => return Ok(Submit::Entered(n)),
      Err(err) => match err.raw_os_error() {
        Some(libc::EINTR) => continue,
        Some(libc::EAGAIN) | Some(libc::EBUSY) => {
          tracing::trace!("enter reported busy; drain and retry");
          return Ok(Submit::AwaitCompletions);
        }
        _ => return Err(err.into()),
      },
    }
  }
}

/// Mutable queue state; owned by the [`SubmissionQueue`] monitor.
pub(crate) struct SqInner {
  view: SqView,
  sq_polled: bool,
  /// Trails the kernel-visible tail until `notify` publishes.
  tail_internal: u32,
  /// Publication cursor: entries below it have been handed to the
  /// kernel-visible side.
  head_internal: u32,
  /// Set by a parking boss; a producer that observes it clears it and
  /// signals the unblock handle after releasing the lock.
  pub should_unblock: bool,
}

// SAFETY: the raw view pointers target kernel-shared mappings; the
// monitor in SubmissionQueue serializes every access.
unsafe impl Send for SqInner {}

impl SqInner {
  pub fn new(view: SqView, sq_polled: bool) -> SqInner {
    // SAFETY: view pointers are valid for the life of the mapping.
    let published = unsafe { (*view.tail).load(Ordering::Relaxed) };
    SqInner {
      view,
      sq_polled,
      tail_internal: published,
      head_internal: published,
      should_unblock: false,
    }
  }

  fn effective_head(&self) -> u32 {
    if self.sq_polled {
      // SAFETY: head points into the shared ring; the kernel stores it
      // with release ordering.
      unsafe { (*self.view.head).load(Ordering::Acquire) }
    } else {
      self.head_internal
    }
  }

  pub fn used(&self) -> u32 {
    self.tail_internal.wrapping_sub(self.effective_head())
  }

  pub fn available(&self) -> u32 {
    self.view.entries - self.used()
  }

  pub fn space_for(&self, count: u32) -> bool {
    self
      .tail_internal
      .wrapping_add(count)
      .wrapping_sub(self.effective_head())
      <= self.view.entries
  }

  /// Stage one record: issue its token, copy it into the slot at the
  /// internal tail, and advance. Returns `None` when the queue is full;
  /// nothing is written in that case.
  pub fn try_stage(&mut self, mut sqe: Sqe) -> Option<u64> {
    if !self.space_for(1) {
      return None;
    }
    let token = token(sqe.fd, self.tail_internal);
    sqe.user_data = token;
    let slot = (self.tail_internal & self.view.mask) as usize;
    // SAFETY: slot is within the mapped SQE array and, by the fullness
    // check, not owned by the kernel.
    unsafe {
      *self.view.sqes.add(slot) = sqe;
    }
    self.tail_internal = self.tail_internal.wrapping_add(1);
    Some(token)
  }

  /// Publish every staged entry to the kernel in staging order and
  /// return the number of entries the kernel has not yet consumed.
  pub fn notify(&mut self) -> u32 {
    // SAFETY: all pointers target the live mapping; we are the only
    // tail writer, so a relaxed read of our own last store is exact.
    unsafe {
      debug_assert_eq!(
        (*self.view.dropped).load(Ordering::Relaxed),
        0,
        "kernel dropped a well-formed sqe"
      );
      let mut tail = (*self.view.tail).load(Ordering::Relaxed);
      while self.head_internal != self.tail_internal {
        *self.view.array.add((tail & self.view.mask) as usize) =
          self.head_internal & self.view.mask;
        tail = tail.wrapping_add(1);
        self.head_internal = self.head_internal.wrapping_add(1);
      }
      (*self.view.tail).store(tail, Ordering::Release);
      tail.wrapping_sub((*self.view.head).load(Ordering::Acquire))
    }
  }

  /// Whether `io_uring_enter` is needed to make progress, and the
  /// flags to pass. Without SQPOLL the kernel only consumes entries
  /// inside the syscall; with it, the syscall is only needed to wake
  /// an idle poller thread.
  pub fn should_enter(&self) -> (bool, u32) {
    if !self.sq_polled {
      return (true, 0);
    }
    // SAFETY: flags points into the shared ring.
    let flags = unsafe { (*self.view.flags).load(Ordering::Relaxed) };
    if flags & params::SQ_NEED_WAKEUP != 0 {
      (true, params::ENTER_SQ_WAKEUP)
    } else {
      (false, 0)
    }
  }
}

/// The submission queue adapter: the monitor shared by every producer
/// thread and the boss reaper.
pub(crate) struct SubmissionQueue {
  inner: Mutex<SqInner>,
  ring: Arc<RingHandle>,
  store: Arc<OpStore>,
  unblock: Arc<Unblock>,
  io_polled: bool,
}

impl SubmissionQueue {
  pub fn new(
    ring: Arc<RingHandle>,
    store: Arc<OpStore>,
    unblock: Arc<Unblock>,
  ) -> SubmissionQueue {
    let sq_polled = ring.flags() & params::SETUP_SQPOLL != 0;
    let io_polled = ring.flags() & params::SETUP_IOPOLL != 0;
    let inner = Mutex::new(SqInner::new(ring.sq_view(), sq_polled));
    SubmissionQueue { inner, ring, store, unblock, io_polled }
  }

  pub fn lock(&self) -> MutexGuard<'_, SqInner> {
    self.inner.lock()
  }

  /// Stage a single operation and register it under its token.
  pub fn stage_one(
    &self,
    sqe: Sqe,
    callback: OpCallback,
  ) -> Result<u64, RingError> {
    let (token, wake) = {
      let mut queue = self.inner.lock();
      let Some(token) = queue.try_stage(sqe) else {
        return Err(RingError::SubmissionQueueFull);
      };
      self.store.insert(token, callback);
      (token, std::mem::take(&mut queue.should_unblock))
    };
    // The eventfd write happens after the lock is released so a parked
    // boss never contends with the producer holding the monitor.
    if wake {
      self.unblock.write();
    }
    Ok(token)
  }

  /// Stage a batch as a unit. Either every record is staged with
  /// consecutive tokens, or the whole batch is rejected and no token
  /// is issued; a half-staged link chain would be malformed.
  pub fn stage_many(
    &self,
    entries: Vec<(Sqe, OpCallback)>,
  ) -> Result<Vec<u64>, RingError> {
    let mut tokens = Vec::with_capacity(entries.len());
    let wake = {
      let mut queue = self.inner.lock();
      if !queue.space_for(entries.len() as u32) {
        return Err(RingError::SubmissionQueueFull);
      }
      for (sqe, callback) in entries {
        let token = queue
          .try_stage(sqe)
          .expect("space was checked for the whole batch");
        self.store.insert(token, callback);
        tokens.push(token);
      }
      std::mem::take(&mut queue.should_unblock)
    };
    if wake {
      self.unblock.write();
    }
    Ok(tokens)
  }

  /// Publish staged entries, then enter the kernel if anything needs
  /// submitting or reaping.
  pub fn submit_and_wait(
    &self,
    min_complete: u32,
  ) -> Result<Submit, RingError> {
    let (in_flight, should_enter, mut flags) = {
      let mut queue = self.inner.lock();
      let in_flight = queue.notify();
      let (should_enter, flags) = queue.should_enter();
      (in_flight, should_enter, flags)
    };
    if !should_enter && min_complete == 0 {
      return Ok(Submit::Skipped);
    }
    if min_complete > 0 || self.io_polled {
      flags |= params::ENTER_GETEVENTS;
    }
    enter_loop(&self.ring, in_flight, min_complete, flags)
  }

  pub fn entries(&self) -> u32 {
    self.ring.sq_entries()
  }

  pub fn used(&self) -> u32 {
    self.inner.lock().used()
  }

  pub fn available(&self) -> u32 {
    self.inner.lock().available()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cio_uring::{opcode, Builder};
  use proptest::prelude::*;
  use std::sync::atomic::AtomicU32;

  /// Heap-backed stand-in for the mmap'd submission ring.
  struct FakeSq {
    head: AtomicU32,
    tail: AtomicU32,
    flags: AtomicU32,
    dropped: AtomicU32,
    array: Box<[u32]>,
    sqes: Box<[Sqe]>,
    entries: u32,
  }

  impl FakeSq {
    fn new(entries: u32) -> FakeSq {
      assert!(entries.is_power_of_two());
      FakeSq {
        head: AtomicU32::new(0),
        tail: AtomicU32::new(0),
        flags: AtomicU32::new(0),
        dropped: AtomicU32::new(0),
        array: vec![u32::MAX; entries as usize].into_boxed_slice(),
        sqes: vec![opcode::Nop::new().build(); entries as usize]
          .into_boxed_slice(),
        entries,
      }
    }

    fn view(&mut self) -> SqView {
      SqView {
        head: &self.head,
        tail: &self.tail,
        flags: &self.flags,
        dropped: &self.dropped,
        array: self.array.as_mut_ptr(),
        sqes: self.sqes.as_mut_ptr(),
        mask: self.entries - 1,
        entries: self.entries,
      }
    }
  }

  fn nop_with_fd(fd: i32) -> Sqe {
    let mut sqe = opcode::Nop::new().build();
    sqe.fd = fd;
    sqe
  }

  #[test]
  fn staging_stops_exactly_at_capacity() {
    let mut fake = FakeSq::new(8);
    let mut queue = SqInner::new(fake.view(), false);

    for i in 0..8 {
      assert_eq!(queue.used() + queue.available(), 8);
      assert!(queue.try_stage(nop_with_fd(-1)).is_some(), "slot {i}");
    }
    assert_eq!(queue.used(), 8);
    assert_eq!(queue.available(), 0);
    assert!(queue.try_stage(nop_with_fd(-1)).is_none());
    // The rejected stage must not have touched the tail.
    assert_eq!(queue.used(), 8);
  }

  #[test]
  fn tokens_encode_fd_and_tail() {
    let mut fake = FakeSq::new(8);
    let mut queue = SqInner::new(fake.view(), false);

    let first = queue.try_stage(nop_with_fd(5)).unwrap();
    let second = queue.try_stage(nop_with_fd(-1)).unwrap();
    assert_eq!(first, 5u64 << 32);
    assert_eq!(second, (0xFFFF_FFFFu64 << 32) | 1);
    // The token is written into the staged record itself.
    assert_eq!(fake.sqes[0].user_data, first);
    assert_eq!(fake.sqes[1].user_data, second);
  }

  #[test]
  fn notify_publishes_in_staging_order() {
    let mut fake = FakeSq::new(8);
    let mut queue = SqInner::new(fake.view(), false);

    for _ in 0..3 {
      queue.try_stage(nop_with_fd(-1)).unwrap();
    }
    // Nothing is kernel-visible until notify.
    assert_eq!(fake.tail.load(Ordering::Acquire), 0);

    let in_flight = queue.notify();
    assert_eq!(in_flight, 3);
    assert_eq!(fake.tail.load(Ordering::Acquire), 3);
    assert_eq!(&fake.array[..3], &[0u32, 1, 2][..]);

    // Idempotent with nothing new staged.
    assert_eq!(queue.notify(), 3);
    assert_eq!(fake.tail.load(Ordering::Acquire), 3);
  }

  #[test]
  fn slots_recycle_after_publication() {
    let mut fake = FakeSq::new(8);
    let mut queue = SqInner::new(fake.view(), false);

    for round in 0u32..4 {
      for _ in 0..8 {
        queue.try_stage(nop_with_fd(-1)).unwrap();
      }
      assert!(queue.try_stage(nop_with_fd(-1)).is_none());
      queue.notify();
      // Mimic the kernel consuming everything during enter.
      fake.head.store((round + 1) * 8, Ordering::Release);
      assert_eq!(queue.available(), 8);
    }
    assert_eq!(fake.tail.load(Ordering::Acquire), 32);
  }

  #[test]
  fn sqpoll_fullness_follows_the_kernel_head() {
    let mut fake = FakeSq::new(8);
    let mut queue = SqInner::new(fake.view(), true);

    for _ in 0..8 {
      queue.try_stage(nop_with_fd(-1)).unwrap();
    }
    queue.notify();
    assert!(queue.try_stage(nop_with_fd(-1)).is_none());
    // The polling kernel consumes two entries on its own.
    fake.head.store(2, Ordering::Release);
    assert_eq!(queue.available(), 2);
    assert!(queue.try_stage(nop_with_fd(-1)).is_some());
  }

  #[test]
  fn should_enter_tracks_the_wakeup_flag() {
    let mut fake = FakeSq::new(8);
    let queue = SqInner::new(fake.view(), false);
    assert_eq!(queue.should_enter(), (true, 0));

    let mut fake = FakeSq::new(8);
    fake.flags.store(params::SQ_NEED_WAKEUP, Ordering::Release);
    let queue = SqInner::new(fake.view(), true);
    assert_eq!(
      queue.should_enter(),
      (true, params::ENTER_SQ_WAKEUP)
    );

    fake.flags.store(0, Ordering::Release);
    assert_eq!(queue.should_enter(), (false, 0));
  }

  proptest! {
    #[test]
    fn token_packs_both_halves(fd in any::<i32>(), tail in any::<u32>()) {
      let packed = token(fd, tail);
      prop_assert_eq!((packed >> 32) as u32, fd as u32);
      prop_assert_eq!(packed as u32, tail);
    }
  }

  // Kernel-backed coverage below: a real ring, but no reaper threads,
  // so queue pressure is fully deterministic.

  fn bare_adapters(
    entries: u32,
  ) -> (Arc<RingHandle>, Arc<OpStore>, SubmissionQueue) {
    let ring =
      Arc::new(RingHandle::new(entries, Builder::default()).unwrap());
    let store = Arc::new(OpStore::with_capacity(64));
    let unblock = Arc::new(Unblock::new().unwrap());
    let sq =
      SubmissionQueue::new(Arc::clone(&ring), Arc::clone(&store), unblock);
    (ring, store, sq)
  }

  fn noop() -> OpCallback {
    OpCallback::new(|_| {})
  }

  #[test]
  fn queue_full_then_reap_frees_a_slot() {
    let (ring, store, sq) = bare_adapters(8);
    let cq = crate::cqueue::CompletionQueue::new(Arc::clone(&ring));

    let mut tokens = Vec::new();
    for _ in 0..8 {
      tokens.push(sq.stage_one(opcode::Nop::new().build(), noop()).unwrap());
    }
    assert_eq!(
      sq.stage_one(opcode::Nop::new().build(), noop()).unwrap_err(),
      RingError::SubmissionQueueFull
    );
    assert_eq!(store.pending(), 8);
    assert_eq!(sq.used(), 8);
    assert_eq!(sq.available(), 0);

    assert!(matches!(
      sq.submit_and_wait(1).unwrap(),
      Submit::Entered(_)
    ));
    let cqe = cq.read().unwrap();
    assert!(tokens.contains(&cqe.user_data));
    assert_eq!(cqe.res, 0);
    let mut record = store.remove(cqe.user_data).unwrap();
    record.callback.take().unwrap().call(cqe.res);
    store.release(record);

    assert!(sq.stage_one(opcode::Nop::new().build(), noop()).is_ok());
  }

  #[test]
  fn oversized_batch_is_rejected_as_a_unit() {
    let (_ring, store, sq) = bare_adapters(8);

    for _ in 0..7 {
      sq.stage_one(opcode::Nop::new().build(), noop()).unwrap();
    }
    let mut linked = opcode::Nop::new().build();
    linked.flags = cio_uring::sqe::SqeFlags::LINK.bits();
    let batch =
      vec![(linked, noop()), (opcode::Nop::new().build(), noop())];
    assert_eq!(
      sq.stage_many(batch).unwrap_err(),
      RingError::SubmissionQueueFull
    );
    // No token issued, no registry entry added.
    assert_eq!(store.pending(), 7);
    assert_eq!(sq.used(), 7);

    let batch = vec![(opcode::Nop::new().build(), noop())];
    assert_eq!(sq.stage_many(batch).unwrap().len(), 1);
    assert_eq!(store.pending(), 8);
  }

  #[test]
  fn batch_tokens_are_consecutive() {
    let (_ring, _store, sq) = bare_adapters(8);
    let batch = vec![
      (opcode::Nop::new().build(), noop()),
      (opcode::Nop::new().build(), noop()),
      (opcode::Nop::new().build(), noop()),
    ];
    let tokens = sq.stage_many(batch).unwrap();
    assert_eq!(tokens.len(), 3);
    for pair in tokens.windows(2) {
      assert_eq!((pair[0] as u32).wrapping_add(1), pair[1] as u32);
    }
  }
}
