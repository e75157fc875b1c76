//! Kernel ABI record layouts.
//!
//! The submission queue entry is a fixed 64-byte record; the completion
//! queue entry is 16 bytes. Both are written to / read from memory the
//! kernel shares with the process, so the layouts here must match the
//! kernel's `struct io_uring_sqe` / `struct io_uring_cqe` byte for byte.
//! The kernel declares several fields as unions; this crate flattens
//! them to the member each supported opcode actually uses (`off` covers
//! `addr2`, `op_flags` covers the per-opcode flag union, `buf_index`
//! covers `buf_group`).

/// Opcode numbers, as accepted in [`Sqe::opcode`].
pub mod op {
  pub const NOP: u8 = 0;
  pub const READV: u8 = 1;
  pub const WRITEV: u8 = 2;
  pub const FSYNC: u8 = 3;
  pub const READ_FIXED: u8 = 4;
  pub const WRITE_FIXED: u8 = 5;
  pub const POLL_ADD: u8 = 6;
  pub const POLL_REMOVE: u8 = 7;
  pub const SYNC_FILE_RANGE: u8 = 8;
  pub const SENDMSG: u8 = 9;
  pub const RECVMSG: u8 = 10;
  pub const TIMEOUT: u8 = 11;
  pub const TIMEOUT_REMOVE: u8 = 12;
  pub const ACCEPT: u8 = 13;
  pub const ASYNC_CANCEL: u8 = 14;
  pub const LINK_TIMEOUT: u8 = 15;
  pub const CONNECT: u8 = 16;
  pub const FALLOCATE: u8 = 17;
  pub const OPENAT: u8 = 18;
  pub const CLOSE: u8 = 19;
  pub const FILES_UPDATE: u8 = 20;
  pub const STATX: u8 = 21;
  pub const READ: u8 = 22;
  pub const WRITE: u8 = 23;
  pub const FADVISE: u8 = 24;
  pub const MADVISE: u8 = 25;
  pub const SEND: u8 = 26;
  pub const RECV: u8 = 27;
  pub const OPENAT2: u8 = 28;
  pub const EPOLL_CTL: u8 = 29;
}

/// `IORING_FSYNC_DATASYNC`: fdatasync semantics for [`op::FSYNC`].
pub const FSYNC_DATASYNC: u32 = 1 << 0;
/// `IORING_TIMEOUT_ABS`: the timespec carries an absolute deadline.
pub const TIMEOUT_ABS: u32 = 1 << 0;

/// Submission queue entry (`struct io_uring_sqe`, 64 bytes).
///
/// Encoders fill every field but `user_data`; the submission queue
/// adapter overwrites `user_data` with the issued token just before the
/// record is copied into its ring slot.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Sqe {
  pub opcode: u8,
  pub flags: u8,
  pub ioprio: u16,
  pub fd: i32,
  /// Byte offset, `addr2`, or an addrlen pointer depending on opcode.
  pub off: u64,
  /// Buffer, iovec array, path or msghdr address depending on opcode.
  pub addr: u64,
  pub len: u32,
  /// Per-opcode flag union (`rw_flags`, `fsync_flags`, `msg_flags`, ...).
  pub op_flags: u32,
  pub user_data: u64,
  pub buf_index: u16,
  pub personality: u16,
  pub splice_fd_in: i32,
  pub pad: [u64; 2],
}

impl Sqe {
  pub(crate) fn zeroed() -> Sqe {
    // SAFETY: all fields are plain integers; the all-zero pattern is the
    // kernel's own "unused" encoding.
    unsafe { std::mem::zeroed() }
  }
}

/// Completion queue entry (`struct io_uring_cqe`, 16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Cqe {
  /// Token copied verbatim from the originating [`Sqe`].
  pub user_data: u64,
  /// Operation result; `>= 0` on success, a negated errno otherwise.
  pub res: i32,
  pub flags: u32,
}

/// Per-submission option flags (`IOSQE_*`).
///
/// These flow through the submission path unchanged and control
/// chaining, draining and async execution inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqeFlags(u8);

impl SqeFlags {
  pub const NONE: Self = Self(0);

  /// Interpret `fd` as an index into the registered file table.
  pub const FIXED_FILE: Self = Self(1 << 0);

  /// Do not start this operation until all prior ones complete.
  pub const IO_DRAIN: Self = Self(1 << 1);

  /// Chain the next submission after this one; the chain completes in
  /// order, and a failure cancels the remainder.
  pub const LINK: Self = Self(1 << 2);

  /// Like [`SqeFlags::LINK`], but the chain survives member failures.
  pub const HARDLINK: Self = Self(1 << 3);

  /// Always punt to async execution instead of attempting inline.
  pub const ASYNC: Self = Self(1 << 4);

  /// Select a buffer from a registered buffer group.
  pub const BUFFER_SELECT: Self = Self(1 << 5);

  pub const fn or(self, other: Self) -> Self {
    Self(self.0 | other.0)
  }

  pub const fn contains(self, other: Self) -> bool {
    (self.0 & other.0) == other.0
  }

  pub const fn bits(self) -> u8 {
    self.0
  }
}

impl std::ops::BitOr for SqeFlags {
  type Output = Self;
  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

/// `struct __kernel_timespec`, consumed by [`op::TIMEOUT`] and
/// [`op::LINK_TIMEOUT`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
  pub tv_sec: i64,
  pub tv_nsec: i64,
}

impl Timespec {
  pub fn from_millis(ms: u64) -> Timespec {
    Timespec {
      tv_sec: (ms / 1_000) as i64,
      tv_nsec: ((ms % 1_000) * 1_000_000) as i64,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::mem;

  #[test]
  fn abi_sizes() {
    assert_eq!(mem::size_of::<Sqe>(), 64);
    assert_eq!(mem::size_of::<Cqe>(), 16);
    assert_eq!(mem::size_of::<Timespec>(), 16);
  }

  #[test]
  fn flag_composition() {
    let f = SqeFlags::LINK | SqeFlags::ASYNC;
    assert!(f.contains(SqeFlags::LINK));
    assert!(f.contains(SqeFlags::ASYNC));
    assert!(!f.contains(SqeFlags::IO_DRAIN));
    assert_eq!(f.bits(), (1 << 2) | (1 << 4));
  }
}
