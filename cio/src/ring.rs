//! The public ring facade: configuration, lifecycle, and one submit
//! entry point per opcode.
//!
//! Every entry point encodes a 64-byte submission record and delegates
//! to the submission queue adapter; the returned token identifies the
//! operation for cancellation and correlation. Completion callbacks
//! receive the kernel result verbatim, negative errnos included.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use cio_uring::opcode::{self, OpenHow};
use cio_uring::sqe::{Sqe, SqeFlags, Timespec};
use cio_uring::{Builder, RingHandle};
use parking_lot::Mutex;

use crate::callback::OpCallback;
use crate::cqueue::CompletionQueue;
use crate::dispatch::Dispatcher;
use crate::error::RingError;
use crate::reaper::{self, Engine};
use crate::squeue::SubmissionQueue;
use crate::store::OpStore;
use crate::unblock::Unblock;

/// Ring configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
  entries: u32,
  completion_threads: usize,
  run_continuations_asynchronously: bool,
  ring_options: Builder,
}

impl Config {
  /// `entries` sizes the submission queue (power of two; the kernel
  /// usually sizes the completion queue at twice that).
  pub fn new(entries: u32) -> Config {
    Config {
      entries,
      completion_threads: 1,
      run_continuations_asynchronously: false,
      ring_options: Builder::default(),
    }
  }

  /// Number of reaper threads, at least 1.
  pub fn completion_threads(mut self, threads: usize) -> Config {
    self.completion_threads = threads.max(1);
    self
  }

  /// Invoke completion callbacks on a background worker pool instead
  /// of inline on the reaper threads.
  pub fn run_continuations_asynchronously(mut self, on: bool) -> Config {
    self.run_continuations_asynchronously = on;
    self
  }

  /// Pass-through kernel setup options (SQPOLL, IOPOLL, affinity).
  pub fn ring_options(mut self, options: Builder) -> Config {
    self.ring_options = options;
    self
  }
}

/// A pre-encoded submission paired with its completion callback, for
/// [`Ring::submit_many`]. This is the staging form for linked chains.
pub struct Prepared {
  sqe: Sqe,
  callback: OpCallback,
}

impl Prepared {
  pub fn new(
    sqe: Sqe,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Prepared {
    Prepared { sqe, callback: OpCallback::new(on_complete) }
  }

  /// Apply per-submission options (link, drain, async, ...).
  pub fn flags(mut self, opts: SqeFlags) -> Prepared {
    self.sqe.flags = opts.bits();
    self
  }
}

/// A live io_uring engine.
///
/// Cloneable access is not needed: the ring is `Sync`, so producers
/// share it behind an `Arc` or a reference. Disposal joins the reaper
/// threads and must not be invoked from inside a completion callback.
pub struct Ring {
  engine: Arc<Engine>,
  reapers: Mutex<Vec<JoinHandle<()>>>,
  torn_down: AtomicBool,
}

impl Ring {
  /// Set up the kernel ring, construct the adapters, arm the unblock
  /// handle and spawn the reaper pool.
  pub fn new(config: Config) -> Result<Ring, RingError> {
    let threads = config.completion_threads.max(1);
    let ring =
      Arc::new(RingHandle::new(config.entries, config.ring_options)?);
    let store = Arc::new(OpStore::with_capacity(
      ring.sq_entries() as usize * 2,
    ));
    let unblock = Arc::new(Unblock::new()?);
    let sq = SubmissionQueue::new(
      Arc::clone(&ring),
      Arc::clone(&store),
      Arc::clone(&unblock),
    );
    let cq = CompletionQueue::new(Arc::clone(&ring));
    let dispatcher = config
      .run_continuations_asynchronously
      .then(|| Dispatcher::spawn(threads, Arc::clone(&store)));

    let engine = Arc::new(Engine {
      ring,
      sq,
      cq,
      store,
      unblock,
      dispatcher,
      asynchronous: config.run_continuations_asynchronously,
      barrier: Barrier::new(threads),
      disposed: AtomicBool::new(false),
      unblock_token: AtomicU64::new(u64::MAX),
      failure: Mutex::new(None),
    });

    // The wake read must be pending before any reaper can park.
    reaper::arm_unblock(&engine);

    let reapers = (0..threads)
      .map(|index| {
        let engine = Arc::clone(&engine);
        thread::Builder::new()
          .name(format!("cio-reaper-{index}"))
          .spawn(move || reaper::run(engine, index))
          .expect("failed to spawn reaper thread")
      })
      .collect();

    Ok(Ring {
      engine,
      reapers: Mutex::new(reapers),
      torn_down: AtomicBool::new(false),
    })
  }

  fn submit(
    &self,
    mut sqe: Sqe,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    if self.engine.disposed() {
      return Err(RingError::Disposed);
    }
    sqe.flags = opts.bits();
    self.engine.sq.stage_one(sqe, OpCallback::new(on_complete))
  }

  /// Stage a batch atomically: either every entry is staged, in order
  /// and with consecutive tokens, or none is. Link chains built with
  /// [`Prepared::flags`] stay intact either way.
  pub fn submit_many(
    &self,
    batch: Vec<Prepared>,
  ) -> Result<Vec<u64>, RingError> {
    if self.engine.disposed() {
      return Err(RingError::Disposed);
    }
    let entries = batch
      .into_iter()
      .map(|prepared| (prepared.sqe, prepared.callback))
      .collect();
    self.engine.sq.stage_many(entries)
  }

  // Introspection ---------------------------------------------------

  pub fn submission_queue_size(&self) -> u32 {
    self.engine.sq.entries()
  }

  pub fn completion_queue_size(&self) -> u32 {
    self.engine.ring.cq_entries()
  }

  pub fn submission_entries_used(&self) -> u32 {
    self.engine.sq.used()
  }

  pub fn submission_entries_available(&self) -> u32 {
    self.engine.sq.available()
  }

  pub fn single_mmap(&self) -> bool {
    self.engine.ring.features().single_mmap()
  }

  pub fn nodrop(&self) -> bool {
    self.engine.ring.features().nodrop()
  }

  pub fn submit_stable(&self) -> bool {
    self.engine.ring.features().submit_stable()
  }

  /// First fatal reaper error, if the ring failed.
  pub fn health_error(&self) -> Option<RingError> {
    self.engine.health()
  }

  pub fn is_disposed(&self) -> bool {
    self.engine.disposed()
  }

  // Lifecycle -------------------------------------------------------

  /// Tear the ring down: wake the parked boss, join every reaper,
  /// drain the dispatch pool, release pending records, and close the
  /// unblock handle and ring descriptor. Idempotent.
  pub fn dispose(&self) {
    if self.torn_down.swap(true, Ordering::AcqRel) {
      return;
    }
    tracing::debug!("disposing ring");
    self.engine.disposed.store(true, Ordering::Release);
    self.engine.unblock.write();
    for handle in self.reapers.lock().drain(..) {
      let _ = handle.join();
    }
    if let Some(dispatcher) = &self.engine.dispatcher {
      dispatcher.shutdown();
    }
    self.engine.store.clear();
    self.engine.unblock.close();
  }

  // Encoders --------------------------------------------------------

  /// Submit a no-op; its completion carries result 0.
  pub fn nop(
    &self,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(opcode::Nop::new().build(), opts, on_complete)
  }

  /// Vectored read at `offset`.
  ///
  /// # Safety
  /// `iovec` must point to `nr_vecs` iovecs whose buffers stay valid
  /// and unaliased until the completion callback runs; `fd` must stay
  /// open as long.
  pub unsafe fn readv(
    &self,
    fd: RawFd,
    iovec: *const libc::iovec,
    nr_vecs: u32,
    offset: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Readv::new(fd, iovec, nr_vecs).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// Vectored write at `offset`.
  ///
  /// # Safety
  /// As for [`Ring::readv`].
  pub unsafe fn writev(
    &self,
    fd: RawFd,
    iovec: *const libc::iovec,
    nr_vecs: u32,
    offset: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Writev::new(fd, iovec, nr_vecs).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// Read `nbytes` into `buf` at `offset`.
  ///
  /// # Safety
  /// `buf` must stay valid and unaliased for `nbytes` until the
  /// completion callback runs; `fd` must stay open as long.
  pub unsafe fn read(
    &self,
    fd: RawFd,
    buf: *mut u8,
    nbytes: u32,
    offset: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Read::new(fd, buf, nbytes).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// Write `nbytes` from `buf` at `offset`.
  ///
  /// # Safety
  /// As for [`Ring::read`].
  pub unsafe fn write(
    &self,
    fd: RawFd,
    buf: *const u8,
    nbytes: u32,
    offset: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Write::new(fd, buf, nbytes).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// Read into a registered buffer.
  ///
  /// # Safety
  /// `buf` must lie within the registered buffer at `buf_index` and
  /// stay valid until completion.
  pub unsafe fn read_fixed(
    &self,
    fd: RawFd,
    buf: *mut u8,
    nbytes: u32,
    offset: u64,
    buf_index: u16,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::ReadFixed::new(fd, buf, nbytes, buf_index)
        .offset(offset)
        .build(),
      opts,
      on_complete,
    )
  }

  /// Write from a registered buffer.
  ///
  /// # Safety
  /// As for [`Ring::read_fixed`].
  pub unsafe fn write_fixed(
    &self,
    fd: RawFd,
    buf: *const u8,
    nbytes: u32,
    offset: u64,
    buf_index: u16,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::WriteFixed::new(fd, buf, nbytes, buf_index)
        .offset(offset)
        .build(),
      opts,
      on_complete,
    )
  }

  /// File sync; `fsync_flags` may carry
  /// [`cio_uring::sqe::FSYNC_DATASYNC`].
  pub fn fsync(
    &self,
    fd: RawFd,
    fsync_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Fsync::new(fd).flags(fsync_flags).build(),
      opts,
      on_complete,
    )
  }

  /// One-shot readiness poll; the result is the triggered event mask.
  pub fn poll_add(
    &self,
    fd: RawFd,
    events: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(opcode::PollAdd::new(fd, events).build(), opts, on_complete)
  }

  /// Remove a pending poll identified by its token.
  pub fn poll_remove(
    &self,
    target: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(opcode::PollRemove::new(target).build(), opts, on_complete)
  }

  /// `sync_file_range(2)` over `[offset, offset + nbytes)`.
  pub fn sync_file_range(
    &self,
    fd: RawFd,
    nbytes: u32,
    offset: u64,
    range_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::SyncFileRange::new(fd, nbytes)
        .offset(offset)
        .flags(range_flags)
        .build(),
      opts,
      on_complete,
    )
  }

  /// `sendmsg(2)`.
  ///
  /// # Safety
  /// `msg` and everything it references (iovecs, buffers, control
  /// data, name) must stay valid until completion.
  pub unsafe fn sendmsg(
    &self,
    fd: RawFd,
    msg: *const libc::msghdr,
    msg_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::SendMsg::new(fd, msg).flags(msg_flags).build(),
      opts,
      on_complete,
    )
  }

  /// `recvmsg(2)`.
  ///
  /// # Safety
  /// As for [`Ring::sendmsg`], with the buffers writable.
  pub unsafe fn recvmsg(
    &self,
    fd: RawFd,
    msg: *mut libc::msghdr,
    msg_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::RecvMsg::new(fd, msg).flags(msg_flags).build(),
      opts,
      on_complete,
    )
  }

  /// Completes after `count` other completions or when the timespec
  /// expires, whichever comes first; a pure timer completes with
  /// `-ETIME`.
  ///
  /// # Safety
  /// `timespec` must stay valid until completion.
  pub unsafe fn timeout(
    &self,
    timespec: *const Timespec,
    count: u64,
    timeout_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Timeout::new(timespec)
        .count(count)
        .flags(timeout_flags)
        .build(),
      opts,
      on_complete,
    )
  }

  /// Remove a pending timeout identified by its token.
  pub fn timeout_remove(
    &self,
    target: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::TimeoutRemove::new(target).build(),
      opts,
      on_complete,
    )
  }

  /// `accept4(2)`; the result is the connected descriptor.
  ///
  /// # Safety
  /// `addr`/`addrlen` must stay valid until completion (both may be
  /// null to skip peer-address reporting).
  pub unsafe fn accept(
    &self,
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    accept_flags: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Accept::new(fd, addr, addrlen)
        .flags(accept_flags)
        .build(),
      opts,
      on_complete,
    )
  }

  /// Best-effort cancellation of the operation holding `target`. The
  /// target completes with its own result (typically `-ECANCELED`);
  /// this completion reports whether the cancel landed.
  pub fn cancel(
    &self,
    target: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(opcode::AsyncCancel::new(target).build(), opts, on_complete)
  }

  /// `connect(2)`.
  ///
  /// # Safety
  /// `addr` must point to `addrlen` valid bytes until completion.
  pub unsafe fn connect(
    &self,
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Connect::new(fd, addr, addrlen).build(),
      opts,
      on_complete,
    )
  }

  /// Timeout bound to the immediately preceding linked submission.
  ///
  /// # Safety
  /// `timespec` must stay valid until completion.
  pub unsafe fn link_timeout(
    &self,
    timespec: *const Timespec,
    timeout_flags: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::LinkTimeout::new(timespec).flags(timeout_flags).build(),
      opts,
      on_complete,
    )
  }

  /// `send(2)`.
  ///
  /// # Safety
  /// `buf` must stay valid for `nbytes` until completion.
  pub unsafe fn send(
    &self,
    fd: RawFd,
    buf: *const u8,
    nbytes: u32,
    msg_flags: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Send::new(fd, buf, nbytes).flags(msg_flags).build(),
      opts,
      on_complete,
    )
  }

  /// `recv(2)`.
  ///
  /// # Safety
  /// As for [`Ring::send`], with `buf` writable.
  pub unsafe fn recv(
    &self,
    fd: RawFd,
    buf: *mut u8,
    nbytes: u32,
    msg_flags: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Recv::new(fd, buf, nbytes).flags(msg_flags).build(),
      opts,
      on_complete,
    )
  }

  /// `fallocate(2)`.
  pub fn fallocate(
    &self,
    fd: RawFd,
    size: u64,
    offset: u64,
    mode: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Fallocate::new(fd, size).offset(offset).mode(mode).build(),
      opts,
      on_complete,
    )
  }

  /// `openat(2)`; the result is the opened descriptor.
  ///
  /// # Safety
  /// `path` must point to a NUL-terminated string that stays valid
  /// until completion.
  pub unsafe fn openat(
    &self,
    dirfd: RawFd,
    path: *const libc::c_char,
    open_flags: i32,
    mode: u32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::OpenAt::new(dirfd, path)
        .flags(open_flags)
        .mode(mode)
        .build(),
      opts,
      on_complete,
    )
  }

  /// `openat2(2)`.
  ///
  /// # Safety
  /// `path` and `how` must stay valid until completion.
  pub unsafe fn openat2(
    &self,
    dirfd: RawFd,
    path: *const libc::c_char,
    how: *const OpenHow,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::OpenAt2::new(dirfd, path, how).build(),
      opts,
      on_complete,
    )
  }

  /// Close a descriptor through the ring.
  pub fn close_fd(
    &self,
    fd: RawFd,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(opcode::Close::new(fd).build(), opts, on_complete)
  }

  /// Update the registered file table starting at `offset`.
  ///
  /// # Safety
  /// `fds` must point to `nr_fds` descriptors valid until completion.
  pub unsafe fn files_update(
    &self,
    fds: *const RawFd,
    nr_fds: u32,
    offset: u64,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::FilesUpdate::new(fds, nr_fds).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// `statx(2)`.
  ///
  /// # Safety
  /// `path` and `statxbuf` must stay valid until completion.
  pub unsafe fn statx(
    &self,
    dirfd: RawFd,
    path: *const libc::c_char,
    statxbuf: *mut libc::statx,
    mask: u32,
    statx_flags: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Statx::new(dirfd, path, statxbuf, mask)
        .flags(statx_flags)
        .build(),
      opts,
      on_complete,
    )
  }

  /// `posix_fadvise(2)`.
  pub fn fadvise(
    &self,
    fd: RawFd,
    nbytes: u32,
    offset: u64,
    advice: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Fadvise::new(fd, nbytes, advice).offset(offset).build(),
      opts,
      on_complete,
    )
  }

  /// `madvise(2)`.
  ///
  /// # Safety
  /// `[addr, addr + nbytes)` must be a mapping owned by the caller for
  /// the duration of the operation.
  pub unsafe fn madvise(
    &self,
    addr: *const libc::c_void,
    nbytes: u32,
    advice: i32,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::Madvise::new(addr, nbytes, advice).build(),
      opts,
      on_complete,
    )
  }

  /// `epoll_ctl(2)`.
  ///
  /// # Safety
  /// `event` must stay valid until completion (may be null for
  /// `EPOLL_CTL_DEL`).
  pub unsafe fn epoll_ctl(
    &self,
    epfd: RawFd,
    fd: RawFd,
    op: i32,
    event: *const libc::epoll_event,
    opts: SqeFlags,
    on_complete: impl FnOnce(i32) + Send + 'static,
  ) -> Result<u64, RingError> {
    self.submit(
      opcode::EpollCtl::new(epfd, fd, op, event).build(),
      opts,
      on_complete,
    )
  }
}

impl Drop for Ring {
  fn drop(&mut self) {
    self.dispose();
  }
}
