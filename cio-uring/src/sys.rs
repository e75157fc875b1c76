//! Raw syscall and mapping plumbing.

use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;

use crate::params::Params;

/// `io_uring_setup(2)`: create a ring and return its file descriptor.
///
/// The kernel fills `params` with the ring geometry and feature bits.
pub fn setup(entries: u32, params: &mut Params) -> io::Result<RawFd> {
  let res = unsafe {
    libc::syscall(
      libc::SYS_io_uring_setup,
      entries,
      params as *mut Params,
    )
  };
  if res < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(res as RawFd)
}

/// `io_uring_enter(2)`: submit and/or wait for completions.
///
/// Returns the raw result without retrying; callers own the EINTR /
/// EAGAIN / EBUSY policy.
pub fn enter(
  fd: RawFd,
  to_submit: u32,
  min_complete: u32,
  flags: u32,
) -> io::Result<u32> {
  let res = unsafe {
    libc::syscall(
      libc::SYS_io_uring_enter,
      fd,
      to_submit,
      min_complete,
      flags,
      std::ptr::null::<libc::sigset_t>(),
      0usize,
    )
  };
  if res < 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(res as u32)
}

/// A mapped ring region; unmapped on drop.
///
/// The region is shared with the kernel (`MAP_SHARED | MAP_POPULATE`),
/// so the pointer stays valid for the life of the value regardless of
/// what the kernel writes into it.
#[derive(Debug)]
pub struct Mmap {
  ptr: NonNull<libc::c_void>,
  len: usize,
}

// SAFETY: the mapping is plain shared memory; all access goes through
// raw pointers whose synchronization is the caller's responsibility.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
  pub fn map(fd: RawFd, len: usize, offset: i64) -> io::Result<Mmap> {
    let ptr = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_POPULATE,
        fd,
        offset,
      )
    };
    if ptr == libc::MAP_FAILED {
      return Err(io::Error::last_os_error());
    }
    Ok(Mmap {
      // SAFETY: mmap never returns null on success.
      ptr: unsafe { NonNull::new_unchecked(ptr) },
      len,
    })
  }

  pub fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr().cast()
  }

  /// Pointer at `offset` bytes into the mapping.
  ///
  /// # Safety
  /// `offset` plus the size of `T` must lie within the mapping, and the
  /// resulting pointer must be adequately aligned for `T`.
  pub unsafe fn offset_as<T>(&self, offset: usize) -> *mut T {
    debug_assert!(offset + std::mem::size_of::<T>() <= self.len);
    unsafe { self.as_ptr().add(offset).cast() }
  }
}

impl Drop for Mmap {
  fn drop(&mut self) {
    // SAFETY: ptr/len came from a successful mmap of exactly this span.
    unsafe {
      libc::munmap(self.ptr.as_ptr(), self.len);
    }
  }
}
