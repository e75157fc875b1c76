//! # cio-uring
//!
//! Raw kernel interface for io_uring: bit-exact ABI layouts, the
//! `io_uring_setup` / `io_uring_enter` syscalls, ring-region mapping,
//! and one encoder per opcode.
//!
//! This crate deliberately stops below any concurrency policy. It hands
//! out raw pointer views of the two mmap'd queues ([`SqView`],
//! [`CqView`]) and leaves head/tail discipline, locking and completion
//! dispatch to the layer above.
//!
//! ```rust,no_run
//! use cio_uring::{Builder, RingHandle};
//!
//! # fn main() -> std::io::Result<()> {
//! let ring = RingHandle::new(8, Builder::default())?;
//! assert!(ring.sq_entries() >= 8);
//! // Nothing staged, nothing awaited: a plain enter is a no-op.
//! ring.enter(0, 0, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod opcode;
pub mod params;
pub mod sqe;
pub mod sys;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicU32;

use crate::params::{CqOffsets, Features, Params, SqOffsets};
use crate::sqe::{Cqe, Sqe};
use crate::sys::Mmap;

/// Setup-time ring options forwarded into [`Params`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder {
  flags: u32,
  sq_thread_cpu: u32,
  sq_thread_idle: u32,
}

impl Builder {
  /// Enable kernel-side submission queue polling with the given idle
  /// budget in milliseconds.
  pub fn sqpoll(mut self, idle_ms: u32) -> Self {
    self.flags |= params::SETUP_SQPOLL;
    self.sq_thread_idle = idle_ms;
    self
  }

  /// Pin the SQPOLL thread to a CPU. Implies nothing without
  /// [`Builder::sqpoll`].
  pub fn sqpoll_cpu(mut self, cpu: u32) -> Self {
    self.flags |= params::SETUP_SQ_AFF;
    self.sq_thread_cpu = cpu;
    self
  }

  /// Busy-poll for completions instead of relying on interrupts.
  pub fn iopoll(mut self) -> Self {
    self.flags |= params::SETUP_IOPOLL;
    self
  }
}

/// Raw pointer view of the submission side.
///
/// `head`, `tail`, `flags` and `dropped` point into kernel-shared ring
/// memory; `array` and `sqes` are the index array and SQE slot array.
/// All synchronization is the caller's.
#[derive(Debug, Clone, Copy)]
pub struct SqView {
  pub head: *const AtomicU32,
  pub tail: *const AtomicU32,
  pub flags: *const AtomicU32,
  pub dropped: *const AtomicU32,
  pub array: *mut u32,
  pub sqes: *mut Sqe,
  pub mask: u32,
  pub entries: u32,
}

/// Raw pointer view of the completion side.
#[derive(Debug, Clone, Copy)]
pub struct CqView {
  pub head: *const AtomicU32,
  pub tail: *const AtomicU32,
  pub overflow: *const AtomicU32,
  pub cqes: *const Cqe,
  pub mask: u32,
  pub entries: u32,
}

// SAFETY: the views are bundles of pointers into shared mappings; they
// carry no thread affinity of their own.
unsafe impl Send for SqView {}
unsafe impl Send for CqView {}

/// An initialized ring: owns the fd and the mapped regions.
///
/// Field order is teardown order: the fd closes before the rings are
/// unmapped, matching the kernel's expectations. When the kernel
/// advertises single-mmap the CQ aliases the SQ mapping and the alias
/// is simply not held.
#[derive(Debug)]
pub struct RingHandle {
  fd: OwnedFd,
  sq_ring: Mmap,
  cq_ring: Option<Mmap>,
  sqes: Mmap,
  params: Params,
}

// SAFETY: every mutation of the mapped regions goes through raw
// pointers handed out by the views; the handle itself is immutable
// after construction.
unsafe impl Send for RingHandle {}
unsafe impl Sync for RingHandle {}

impl RingHandle {
  /// Set up a ring with `entries` SQ slots (power of two; the kernel
  /// sizes the CQ, usually at twice that) and map its regions.
  pub fn new(entries: u32, builder: Builder) -> io::Result<RingHandle> {
    let mut params = Params {
      flags: builder.flags,
      sq_thread_cpu: builder.sq_thread_cpu,
      sq_thread_idle: builder.sq_thread_idle,
      ..Params::default()
    };

    let raw_fd = sys::setup(entries, &mut params)?;
    // SAFETY: setup returned a freshly created descriptor we own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };
    let features = Features::from_bits(params.features);

    let mut sq_size = params.sq_off.array as usize
      + params.sq_entries as usize * std::mem::size_of::<u32>();
    let mut cq_size = params.cq_off.cqes as usize
      + params.cq_entries as usize * std::mem::size_of::<Cqe>();
    if features.single_mmap() {
      sq_size = sq_size.max(cq_size);
      cq_size = sq_size;
    }

    let sq_ring = Mmap::map(raw_fd, sq_size, params::OFF_SQ_RING)?;
    let cq_ring = if features.single_mmap() {
      None
    } else {
      Some(Mmap::map(raw_fd, cq_size, params::OFF_CQ_RING)?)
    };
    let sqes_size =
      params.sq_entries as usize * std::mem::size_of::<Sqe>();
    let sqes = Mmap::map(raw_fd, sqes_size, params::OFF_SQES)?;

    Ok(RingHandle { fd, sq_ring, cq_ring, sqes, params })
  }

  pub fn fd(&self) -> RawFd {
    self.fd.as_raw_fd()
  }

  pub fn flags(&self) -> u32 {
    self.params.flags
  }

  pub fn features(&self) -> Features {
    Features::from_bits(self.params.features)
  }

  pub fn sq_entries(&self) -> u32 {
    self.params.sq_entries
  }

  pub fn cq_entries(&self) -> u32 {
    self.params.cq_entries
  }

  /// `io_uring_enter` against this ring. No retry policy is applied.
  pub fn enter(
    &self,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
  ) -> io::Result<u32> {
    sys::enter(self.fd(), to_submit, min_complete, flags)
  }

  /// Derive the submission-side pointer view.
  pub fn sq_view(&self) -> SqView {
    let off: &SqOffsets = &self.params.sq_off;
    // SAFETY: every offset was produced by the kernel for this mapping
    // and the mapping spans the whole ring structure.
    unsafe {
      SqView {
        head: self.sq_ring.offset_as(off.head as usize),
        tail: self.sq_ring.offset_as(off.tail as usize),
        flags: self.sq_ring.offset_as(off.flags as usize),
        dropped: self.sq_ring.offset_as(off.dropped as usize),
        array: self.sq_ring.offset_as(off.array as usize),
        sqes: self.sqes.offset_as(0),
        mask: *self.sq_ring.offset_as::<u32>(off.ring_mask as usize),
        entries: *self
          .sq_ring
          .offset_as::<u32>(off.ring_entries as usize),
      }
    }
  }

  /// Derive the completion-side pointer view.
  pub fn cq_view(&self) -> CqView {
    let ring = self.cq_ring.as_ref().unwrap_or(&self.sq_ring);
    let off: &CqOffsets = &self.params.cq_off;
    // SAFETY: as for `sq_view`.
    unsafe {
      CqView {
        head: ring.offset_as(off.head as usize),
        tail: ring.offset_as(off.tail as usize),
        overflow: ring.offset_as(off.overflow as usize),
        cqes: ring.offset_as(off.cqes as usize),
        mask: *ring.offset_as::<u32>(off.ring_mask as usize),
        entries: *ring.offset_as::<u32>(off.ring_entries as usize),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::Ordering;

  #[test]
  fn setup_and_teardown() {
    let ring = RingHandle::new(8, Builder::default()).unwrap();
    assert!(ring.fd() >= 0);
    assert_eq!(ring.sq_entries(), 8);
    assert!(ring.cq_entries() >= 8);
    // Kernels this crate targets all advertise the three core features.
    assert!(ring.features().single_mmap());
    assert!(ring.features().nodrop());
    assert!(ring.features().submit_stable());
  }

  #[test]
  fn views_start_empty() {
    let ring = RingHandle::new(8, Builder::default()).unwrap();
    let sq = ring.sq_view();
    let cq = ring.cq_view();
    assert_eq!(sq.entries, 8);
    assert_eq!(sq.mask, 7);
    unsafe {
      assert_eq!(
        (*sq.head).load(Ordering::Acquire),
        (*sq.tail).load(Ordering::Acquire)
      );
      assert_eq!(
        (*cq.head).load(Ordering::Acquire),
        (*cq.tail).load(Ordering::Acquire)
      );
      assert_eq!((*cq.overflow).load(Ordering::Acquire), 0);
    }
  }

  #[test]
  fn idle_enter_is_a_noop() {
    let ring = RingHandle::new(8, Builder::default()).unwrap();
    assert_eq!(ring.enter(0, 0, 0).unwrap(), 0);
  }
}
