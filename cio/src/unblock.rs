//! Eventfd-backed wakeup for parked reapers.
//!
//! An 8-byte read against the eventfd is kept permanently pending
//! inside the ring. A producer that finds `should_unblock` set performs
//! a plain `write(2)` on the eventfd; the kernel completes the pending
//! read and the parked boss returns from `io_uring_enter`. The read is
//! re-armed by its own completion callback (see the reaper module).
//!
//! The descriptor doubles as the disposed sentinel: once closed, the
//! atomic holds 0 and writes become no-ops, which swallows the benign
//! teardown race between a late producer and ring disposal.

use std::cell::UnsafeCell;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Stable-address target for the pending read. The kernel writes the
/// eventfd counter into `bytes` through `iov` while a read is armed.
struct ReadTarget {
  bytes: UnsafeCell<[u8; 8]>,
  iov: UnsafeCell<libc::iovec>,
}

// SAFETY: the kernel is the only writer of `bytes` while a read is in
// flight, and the process never reads the landing buffer at all.
unsafe impl Send for ReadTarget {}
unsafe impl Sync for ReadTarget {}

pub(crate) struct Unblock {
  fd: AtomicI32,
  armed: AtomicBool,
  target: Box<ReadTarget>,
}

impl Unblock {
  pub fn new() -> io::Result<Unblock> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
      return Err(io::Error::last_os_error());
    }
    let target = Box::new(ReadTarget {
      bytes: UnsafeCell::new([0; 8]),
      iov: UnsafeCell::new(libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
      }),
    });
    // SAFETY: the target is boxed, so the buffer address is stable for
    // the life of the handle.
    unsafe {
      *target.iov.get() = libc::iovec {
        iov_base: target.bytes.get().cast(),
        iov_len: 8,
      };
    }
    Ok(Unblock {
      fd: AtomicI32::new(fd),
      armed: AtomicBool::new(false),
      target,
    })
  }

  pub fn fd(&self) -> RawFd {
    self.fd.load(Ordering::Acquire)
  }

  /// The iovec for the pending READV submission.
  pub fn iovec(&self) -> *const libc::iovec {
    self.target.iov.get()
  }

  /// True while a read is staged or in flight against the ring.
  pub fn is_armed(&self) -> bool {
    self.armed.load(Ordering::Acquire)
  }

  /// Claim the right to arm the next read. At most one claimant wins,
  /// which keeps at most one READV in flight.
  pub fn try_begin_arm(&self) -> bool {
    self
      .armed
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Record that the in-flight read completed (or failed to stage).
  pub fn set_unarmed(&self) {
    self.armed.store(false, Ordering::Release);
  }

  /// Wake a parked reaper. Called by producers after they observe and
  /// clear `should_unblock`, outside the submission lock.
  pub fn write(&self) {
    let fd = self.fd.load(Ordering::Acquire);
    if fd == 0 {
      return;
    }
    let one: u64 = 1;
    loop {
      let res = unsafe {
        libc::write(fd, (&one as *const u64).cast(), 8)
      };
      if res >= 0 {
        return;
      }
      match io::Error::last_os_error().raw_os_error() {
        Some(libc::EINTR) => continue,
        // Teardown race against close(); the ring is going away.
        Some(libc::EBADF) => return,
        errno => {
          tracing::warn!(?errno, "eventfd write failed");
          return;
        }
      }
    }
  }

  /// Close the eventfd and flip the handle into its disposed state.
  pub fn close(&self) {
    let fd = self.fd.swap(0, Ordering::AcqRel);
    if fd != 0 {
      unsafe {
        libc::close(fd);
      }
    }
  }
}

impl Drop for Unblock {
  fn drop(&mut self) {
    self.close();
  }
}
