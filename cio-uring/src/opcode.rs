//! Per-opcode submission encoders.
//!
//! Each operation is a small builder struct: required arguments go
//! through `new`, optional ones through chained setters, and `build`
//! produces the filled 64-byte [`Sqe`]. The encoders only translate
//! arguments into the kernel's field layout; they never touch the ring.
//!
//! # Safety
//!
//! Builders accept raw pointers and file descriptors verbatim. Whoever
//! submits the built record must keep every referenced buffer, path and
//! descriptor valid until the operation's completion is observed.

use std::os::fd::RawFd;

use crate::sqe::{op, Sqe, Timespec};

macro_rules! opcode {
  (@type $name:ty ) => {
    $name
  };
  (
    $( #[$outer:meta] )*
    pub struct $name:ident {
      $( $field:ident : { $( $tnt:tt )+ } ),*
      $(,)?
      ;;
      $(
        $( #[$opt_meta:meta] )*
        $opt_field:ident : $opt_tname:ty = $default:expr
      ),*
      $(,)?
    }

    pub const CODE = $opcode:expr;

    pub fn build($self:ident) -> Sqe $build_block:block
  ) => {
    $( #[$outer] )*
    pub struct $name {
      $( $field : opcode!(@type $( $tnt )*), )*
      $( $opt_field : $opt_tname, )*
    }

    impl $name {
      #[inline]
      pub fn new($( $field : $( $tnt )* ),*) -> Self {
        $name {
          $( $field, )*
          $( $opt_field: $default, )*
        }
      }

      /// The kernel opcode this encoder produces.
      pub const CODE: u8 = $opcode;

      $(
        $( #[$opt_meta] )*
        #[inline]
        pub fn $opt_field(mut self, $opt_field: $opt_tname) -> Self {
          self.$opt_field = $opt_field;
          self
        }
      )*

      #[inline]
      pub fn build($self) -> Sqe $build_block
    }
  }
}

opcode! {
  /// Do not perform any I/O; completes with result 0.
  #[derive(Debug)]
  pub struct Nop { ;; }

  pub const CODE = op::NOP;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe
  }
}

opcode! {
  /// Vectored read, equivalent to `preadv2(2)`.
  #[derive(Debug)]
  pub struct Readv {
    fd: { RawFd },
    iovec: { *const libc::iovec },
    nr_vecs: { u32 },
    ;;
    offset: u64 = 0,
    rw_flags: i32 = 0,
  }

  pub const CODE = op::READV;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.iovec as u64;
    sqe.len = self.nr_vecs;
    sqe.op_flags = self.rw_flags as u32;
    sqe
  }
}

opcode! {
  /// Vectored write, equivalent to `pwritev2(2)`.
  #[derive(Debug)]
  pub struct Writev {
    fd: { RawFd },
    iovec: { *const libc::iovec },
    nr_vecs: { u32 },
    ;;
    offset: u64 = 0,
    rw_flags: i32 = 0,
  }

  pub const CODE = op::WRITEV;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.iovec as u64;
    sqe.len = self.nr_vecs;
    sqe.op_flags = self.rw_flags as u32;
    sqe
  }
}

opcode! {
  /// Plain read into a single buffer.
  #[derive(Debug)]
  pub struct Read {
    fd: { RawFd },
    buf: { *mut u8 },
    nbytes: { u32 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::READ;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe
  }
}

opcode! {
  /// Plain write from a single buffer.
  #[derive(Debug)]
  pub struct Write {
    fd: { RawFd },
    buf: { *const u8 },
    nbytes: { u32 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::WRITE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe
  }
}

opcode! {
  /// Read into a pre-registered buffer identified by `buf_index`.
  #[derive(Debug)]
  pub struct ReadFixed {
    fd: { RawFd },
    buf: { *mut u8 },
    nbytes: { u32 },
    buf_index: { u16 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::READ_FIXED;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe.buf_index = self.buf_index;
    sqe
  }
}

opcode! {
  /// Write from a pre-registered buffer identified by `buf_index`.
  #[derive(Debug)]
  pub struct WriteFixed {
    fd: { RawFd },
    buf: { *const u8 },
    nbytes: { u32 },
    buf_index: { u16 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::WRITE_FIXED;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe.buf_index = self.buf_index;
    sqe
  }
}

opcode! {
  /// File sync. Completion does not order against writes still in
  /// flight on the same ring; link them explicitly if that matters.
  #[derive(Debug)]
  pub struct Fsync {
    fd: { RawFd },
    ;;
    /// [`crate::sqe::FSYNC_DATASYNC`] for fdatasync semantics.
    flags: u32 = 0,
  }

  pub const CODE = op::FSYNC;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// One-shot poll for readiness events on a descriptor.
  #[derive(Debug)]
  pub struct PollAdd {
    fd: { RawFd },
    events: { u32 },
    ;;
  }

  pub const CODE = op::POLL_ADD;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.op_flags = self.events;
    sqe
  }
}

opcode! {
  /// Remove a pending [`PollAdd`] identified by its user-data token.
  #[derive(Debug)]
  pub struct PollRemove {
    target: { u64 },
    ;;
  }

  pub const CODE = op::POLL_REMOVE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.addr = self.target;
    sqe
  }
}

opcode! {
  /// `sync_file_range(2)`.
  #[derive(Debug)]
  pub struct SyncFileRange {
    fd: { RawFd },
    nbytes: { u32 },
    ;;
    offset: u64 = 0,
    flags: u32 = 0,
  }

  pub const CODE = op::SYNC_FILE_RANGE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.len = self.nbytes;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// `sendmsg(2)`.
  #[derive(Debug)]
  pub struct SendMsg {
    fd: { RawFd },
    msg: { *const libc::msghdr },
    ;;
    flags: u32 = 0,
  }

  pub const CODE = op::SENDMSG;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.addr = self.msg as u64;
    sqe.len = 1;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// `recvmsg(2)`.
  #[derive(Debug)]
  pub struct RecvMsg {
    fd: { RawFd },
    msg: { *mut libc::msghdr },
    ;;
    flags: u32 = 0,
  }

  pub const CODE = op::RECVMSG;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.addr = self.msg as u64;
    sqe.len = 1;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// Completes when `count` completions have been posted since queueing
  /// or when the timespec expires, whichever comes first.
  #[derive(Debug)]
  pub struct Timeout {
    timespec: { *const Timespec },
    ;;
    count: u64 = 0,
    /// [`crate::sqe::TIMEOUT_ABS`] for an absolute deadline.
    flags: u32 = 0,
  }

  pub const CODE = op::TIMEOUT;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.off = self.count;
    sqe.addr = self.timespec as u64;
    sqe.len = 1;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// Remove a pending [`Timeout`] identified by its user-data token.
  #[derive(Debug)]
  pub struct TimeoutRemove {
    target: { u64 },
    ;;
  }

  pub const CODE = op::TIMEOUT_REMOVE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.addr = self.target;
    sqe
  }
}

opcode! {
  /// `accept4(2)`.
  #[derive(Debug)]
  pub struct Accept {
    fd: { RawFd },
    addr: { *mut libc::sockaddr },
    addrlen: { *mut libc::socklen_t },
    ;;
    flags: i32 = 0,
  }

  pub const CODE = op::ACCEPT;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.addrlen as u64;
    sqe.addr = self.addr as u64;
    sqe.op_flags = self.flags as u32;
    sqe
  }
}

opcode! {
  /// Best-effort cancellation of the operation carrying `target`.
  #[derive(Debug)]
  pub struct AsyncCancel {
    target: { u64 },
    ;;
  }

  pub const CODE = op::ASYNC_CANCEL;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.addr = self.target;
    sqe
  }
}

opcode! {
  /// `connect(2)`.
  #[derive(Debug)]
  pub struct Connect {
    fd: { RawFd },
    addr: { *const libc::sockaddr },
    addrlen: { libc::socklen_t },
    ;;
  }

  pub const CODE = op::CONNECT;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.addrlen as u64;
    sqe.addr = self.addr as u64;
    sqe
  }
}

opcode! {
  /// Bound timeout for the immediately preceding linked submission.
  #[derive(Debug)]
  pub struct LinkTimeout {
    timespec: { *const Timespec },
    ;;
    flags: u32 = 0,
  }

  pub const CODE = op::LINK_TIMEOUT;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.addr = self.timespec as u64;
    sqe.len = 1;
    sqe.op_flags = self.flags;
    sqe
  }
}

opcode! {
  /// `send(2)`.
  #[derive(Debug)]
  pub struct Send {
    fd: { RawFd },
    buf: { *const u8 },
    nbytes: { u32 },
    ;;
    flags: i32 = 0,
  }

  pub const CODE = op::SEND;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe.op_flags = self.flags as u32;
    sqe
  }
}

opcode! {
  /// `recv(2)`.
  #[derive(Debug)]
  pub struct Recv {
    fd: { RawFd },
    buf: { *mut u8 },
    nbytes: { u32 },
    ;;
    flags: i32 = 0,
  }

  pub const CODE = op::RECV;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.addr = self.buf as u64;
    sqe.len = self.nbytes;
    sqe.op_flags = self.flags as u32;
    sqe
  }
}

opcode! {
  /// `fallocate(2)`.
  #[derive(Debug)]
  pub struct Fallocate {
    fd: { RawFd },
    size: { u64 },
    ;;
    offset: u64 = 0,
    mode: i32 = 0,
  }

  pub const CODE = op::FALLOCATE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.addr = self.size;
    sqe.len = self.mode as u32;
    sqe
  }
}

opcode! {
  /// `openat(2)`.
  #[derive(Debug)]
  pub struct OpenAt {
    dirfd: { RawFd },
    path: { *const libc::c_char },
    ;;
    flags: i32 = 0,
    mode: u32 = 0,
  }

  pub const CODE = op::OPENAT;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.dirfd;
    sqe.addr = self.path as u64;
    sqe.len = self.mode;
    sqe.op_flags = self.flags as u32;
    sqe
  }
}

/// `struct open_how`, consumed by [`OpenAt2`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenHow {
  pub flags: u64,
  pub mode: u64,
  pub resolve: u64,
}

opcode! {
  /// `openat2(2)`.
  #[derive(Debug)]
  pub struct OpenAt2 {
    dirfd: { RawFd },
    path: { *const libc::c_char },
    how: { *const OpenHow },
    ;;
  }

  pub const CODE = op::OPENAT2;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.dirfd;
    sqe.off = self.how as u64;
    sqe.addr = self.path as u64;
    sqe.len = std::mem::size_of::<OpenHow>() as u32;
    sqe
  }
}

opcode! {
  /// `close(2)`.
  #[derive(Debug)]
  pub struct Close {
    fd: { RawFd },
    ;;
  }

  pub const CODE = op::CLOSE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe
  }
}

opcode! {
  /// Update the registered file table starting at `offset`.
  #[derive(Debug)]
  pub struct FilesUpdate {
    fds: { *const RawFd },
    nr_fds: { u32 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::FILES_UPDATE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.off = self.offset;
    sqe.addr = self.fds as u64;
    sqe.len = self.nr_fds;
    sqe
  }
}

opcode! {
  /// `statx(2)`.
  #[derive(Debug)]
  pub struct Statx {
    dirfd: { RawFd },
    path: { *const libc::c_char },
    statxbuf: { *mut libc::statx },
    mask: { u32 },
    ;;
    flags: i32 = 0,
  }

  pub const CODE = op::STATX;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.dirfd;
    sqe.off = self.statxbuf as u64;
    sqe.addr = self.path as u64;
    sqe.len = self.mask;
    sqe.op_flags = self.flags as u32;
    sqe
  }
}

opcode! {
  /// `posix_fadvise(2)`.
  #[derive(Debug)]
  pub struct Fadvise {
    fd: { RawFd },
    nbytes: { u32 },
    advice: { i32 },
    ;;
    offset: u64 = 0,
  }

  pub const CODE = op::FADVISE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.fd;
    sqe.off = self.offset;
    sqe.len = self.nbytes;
    sqe.op_flags = self.advice as u32;
    sqe
  }
}

opcode! {
  /// `madvise(2)`.
  #[derive(Debug)]
  pub struct Madvise {
    addr: { *const libc::c_void },
    nbytes: { u32 },
    advice: { i32 },
    ;;
  }

  pub const CODE = op::MADVISE;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = -1;
    sqe.addr = self.addr as u64;
    sqe.len = self.nbytes;
    sqe.op_flags = self.advice as u32;
    sqe
  }
}

opcode! {
  /// `epoll_ctl(2)`.
  #[derive(Debug)]
  pub struct EpollCtl {
    epfd: { RawFd },
    fd: { RawFd },
    op: { i32 },
    event: { *const libc::epoll_event },
    ;;
  }

  pub const CODE = op::EPOLL_CTL;

  pub fn build(self) -> Sqe {
    let mut sqe = Sqe::zeroed();
    sqe.opcode = Self::CODE;
    sqe.fd = self.epfd;
    sqe.off = self.fd as u64;
    sqe.addr = self.event as u64;
    sqe.len = self.op as u32;
    sqe
  }
}
