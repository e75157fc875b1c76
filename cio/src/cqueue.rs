//! Completion queue adapter.
//!
//! Dequeues one completion at a time under a monitor so several reapers
//! can drain the ring in parallel, each claiming distinct events. The
//! head advances exactly once per observed completion.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cio_uring::params;
use cio_uring::sqe::Cqe;
use cio_uring::{CqView, RingHandle};
use parking_lot::Mutex;

use crate::error::RingError;
use crate::squeue::{enter_loop, Submit};

pub(crate) struct CqInner {
  view: CqView,
}

// SAFETY: the raw view pointers target kernel-shared mappings; the
// monitor in CompletionQueue serializes every access.
unsafe impl Send for CqInner {}

impl CqInner {
  pub fn new(view: CqView) -> CqInner {
    CqInner { view }
  }

  pub fn is_empty(&self) -> bool {
    // SAFETY: both pointers target the live ring; the tail is written
    // by the kernel with release ordering.
    unsafe {
      (*self.view.head).load(Ordering::Relaxed)
        == (*self.view.tail).load(Ordering::Acquire)
    }
  }

  /// Dequeue one completion if available.
  ///
  /// A non-zero overflow counter means the kernel discarded
  /// completions the registry is still waiting for; that is terminal
  /// for the ring.
  pub fn try_read(&mut self) -> Result<Option<Cqe>, RingError> {
    // SAFETY: all pointers target the live ring mapping; we are the
    // only head writer, serialized by the outer monitor.
    unsafe {
      let head = (*self.view.head).load(Ordering::Relaxed);
      let tail = (*self.view.tail).load(Ordering::Acquire);
      if head == tail {
        return Ok(None);
      }
      if (*self.view.overflow).load(Ordering::Relaxed) != 0 {
        return Err(RingError::CompletionQueueOverflow);
      }
      let cqe = *self.view.cqes.add((head & self.view.mask) as usize);
      (*self.view.head).store(head.wrapping_add(1), Ordering::Release);
      Ok(Some(cqe))
    }
  }
}

pub(crate) struct CompletionQueue {
  inner: Mutex<CqInner>,
  ring: Arc<RingHandle>,
  io_polled: bool,
}

impl CompletionQueue {
  pub fn new(ring: Arc<RingHandle>) -> CompletionQueue {
    let io_polled = ring.flags() & params::SETUP_IOPOLL != 0;
    let inner = Mutex::new(CqInner::new(ring.cq_view()));
    CompletionQueue { inner, ring, io_polled }
  }

  pub fn io_polled(&self) -> bool {
    self.io_polled
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().is_empty()
  }

  /// Dequeue one completion without blocking.
  ///
  /// With IOPOLL the kernel only harvests device completions inside
  /// `io_uring_enter`, so an empty queue gets one non-blocking reap
  /// attempt before reporting empty.
  pub fn try_read(&self) -> Result<Option<Cqe>, RingError> {
    let mut queue = self.inner.lock();
    if self.io_polled && queue.is_empty() {
      enter_loop(&self.ring, 0, 0, params::ENTER_GETEVENTS)?;
    }
    queue.try_read()
  }

  /// Dequeue one completion, blocking in the kernel between misses.
  pub fn read(&self) -> Result<Cqe, RingError> {
    loop {
      if let Some(cqe) = self.try_read()? {
        return Ok(cqe);
      }
      match enter_loop(&self.ring, 0, 1, params::ENTER_GETEVENTS)? {
        Submit::AwaitCompletions | Submit::Entered(_) => {}
        Submit::Skipped => unreachable!("enter_loop never skips"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  /// Heap-backed stand-in for the mmap'd completion ring.
  struct FakeCq {
    head: AtomicU32,
    tail: AtomicU32,
    overflow: AtomicU32,
    cqes: Box<[Cqe]>,
    entries: u32,
  }

  impl FakeCq {
    fn new(entries: u32) -> FakeCq {
      assert!(entries.is_power_of_two());
      FakeCq {
        head: AtomicU32::new(0),
        tail: AtomicU32::new(0),
        overflow: AtomicU32::new(0),
        cqes: vec![
          Cqe { user_data: 0, res: 0, flags: 0 };
          entries as usize
        ]
        .into_boxed_slice(),
        entries,
      }
    }

    fn view(&mut self) -> CqView {
      CqView {
        head: &self.head,
        tail: &self.tail,
        overflow: &self.overflow,
        cqes: self.cqes.as_ptr(),
        mask: self.entries - 1,
        entries: self.entries,
      }
    }

    fn post(&mut self, user_data: u64, res: i32) {
      let tail = self.tail.load(Ordering::Relaxed);
      let slot = (tail & (self.entries - 1)) as usize;
      self.cqes[slot] = Cqe { user_data, res, flags: 0 };
      self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }
  }

  #[test]
  fn empty_queue_reads_none() {
    let mut fake = FakeCq::new(8);
    let mut queue = CqInner::new(fake.view());
    assert!(queue.is_empty());
    assert!(queue.try_read().unwrap().is_none());
    assert_eq!(fake.head.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn head_advances_once_per_completion() {
    let mut fake = FakeCq::new(8);
    let mut queue = CqInner::new(fake.view());

    fake.post(0xa, 1);
    fake.post(0xb, -libc::ECANCELED);

    let first = queue.try_read().unwrap().unwrap();
    assert_eq!(first.user_data, 0xa);
    assert_eq!(first.res, 1);
    assert_eq!(fake.head.load(Ordering::Relaxed), 1);

    let second = queue.try_read().unwrap().unwrap();
    assert_eq!(second.user_data, 0xb);
    assert_eq!(second.res, -libc::ECANCELED);
    assert_eq!(fake.head.load(Ordering::Relaxed), 2);

    assert!(queue.try_read().unwrap().is_none());
    assert_eq!(fake.head.load(Ordering::Relaxed), 2);
  }

  #[test]
  fn wrapping_indices_stay_in_bounds() {
    let mut fake = FakeCq::new(4);
    let mut queue = CqInner::new(fake.view());

    for round in 0..10u64 {
      fake.post(round, 0);
      let cqe = queue.try_read().unwrap().unwrap();
      assert_eq!(cqe.user_data, round);
    }
    assert_eq!(fake.head.load(Ordering::Relaxed), 10);
  }

  #[test]
  fn overflow_is_terminal() {
    let mut fake = FakeCq::new(8);
    let mut queue = CqInner::new(fake.view());

    fake.post(0xa, 0);
    fake.overflow.store(3, Ordering::Release);
    assert_eq!(
      queue.try_read().unwrap_err(),
      RingError::CompletionQueueOverflow
    );
    // The event was not consumed.
    assert_eq!(fake.head.load(Ordering::Relaxed), 0);
  }
}
