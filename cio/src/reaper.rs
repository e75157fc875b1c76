//! The reaper pool.
//!
//! `completion_threads` dedicated threads share a cyclic barrier.
//! Thread 0 is the boss: once per cycle it publishes staged entries,
//! decides whether to park, and performs the `io_uring_enter` syscall
//! on behalf of the pool. After the barrier releases, every reaper
//! drains completions in parallel and dispatches callbacks.
//!
//! Parking protocol: with nothing in flight the boss sets
//! `should_unblock` under the submission lock and blocks in the kernel
//! for one completion. The only in-flight operation at that point is
//! the unblock handle's pending eventfd read, so the next producer's
//! eventfd write is what frees the boss. The boss refuses to park
//! while that read is unarmed; the arm state is CAS-guarded so at most
//! one read is ever in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Weak};

use cio_uring::opcode;
use cio_uring::params;
use cio_uring::sqe::Cqe;
use cio_uring::RingHandle;
use parking_lot::Mutex;

use crate::callback::OpCallback;
use crate::cqueue::CompletionQueue;
use crate::dispatch::Dispatcher;
use crate::error::RingError;
use crate::squeue::{enter_loop, Submit, SubmissionQueue};
use crate::store::OpStore;
use crate::unblock::Unblock;

/// Shared engine state: everything the reapers, producers and facade
/// coordinate through.
pub(crate) struct Engine {
  pub ring: Arc<RingHandle>,
  pub sq: SubmissionQueue,
  pub cq: CompletionQueue,
  pub store: Arc<OpStore>,
  pub unblock: Arc<Unblock>,
  pub dispatcher: Option<Dispatcher>,
  pub asynchronous: bool,
  pub barrier: Barrier,
  pub disposed: AtomicBool,
  pub unblock_token: AtomicU64,
  pub failure: Mutex<Option<RingError>>,
}

impl Engine {
  pub fn disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }

  /// Record the first fatal error and push the ring into disposal so
  /// every reaper exits at its next barrier crossing.
  pub fn fail(&self, error: RingError) {
    {
      let mut slot = self.failure.lock();
      if slot.is_none() {
        *slot = Some(error.clone());
      }
    }
    tracing::error!(%error, "reaper failure; disposing ring");
    self.disposed.store(true, Ordering::Release);
    self.unblock.write();
  }

  pub fn health(&self) -> Option<RingError> {
    self.failure.lock().clone()
  }
}

/// Keep the unblock handle's eventfd read pending inside the ring.
///
/// Primary re-arm path is the read's own completion callback; the boss
/// also calls this from synchronize in case a full submission queue
/// made that re-arm fail. The CAS guard keeps at most one read in
/// flight either way.
pub(crate) fn arm_unblock(engine: &Arc<Engine>) {
  if engine.disposed() || !engine.unblock.try_begin_arm() {
    return;
  }
  let fd = engine.unblock.fd();
  if fd == 0 {
    // Lost a race with disposal.
    engine.unblock.set_unarmed();
    return;
  }

  let weak: Weak<Engine> = Arc::downgrade(engine);
  let callback = OpCallback::new(move |res: i32| {
    let Some(engine) = weak.upgrade() else { return };
    match res {
      8 => arm_unblock(&engine),
      r if r == -libc::EINTR => arm_unblock(&engine),
      // Teardown races: the eventfd or the ring went away first.
      r if r == -libc::EBADF || r == -libc::ECANCELED => {}
      r => tracing::warn!(res = r, "unexpected unblock read result"),
    }
  });

  let sqe = opcode::Readv::new(fd, engine.unblock.iovec(), 1).build();
  match engine.sq.stage_one(sqe, callback) {
    Ok(token) => {
      engine.unblock_token.store(token, Ordering::Release);
      tracing::trace!(token, "unblock read armed");
    }
    Err(error) => {
      engine.unblock.set_unarmed();
      tracing::debug!(%error, "unblock re-arm deferred");
    }
  }
}

/// Reaper thread body.
pub(crate) fn run(engine: Arc<Engine>, index: usize) {
  let boss = index == 0;
  tracing::trace!(index, boss, "reaper started");
  loop {
    if boss && !engine.disposed() {
      synchronize(&engine);
    }
    engine.barrier.wait();
    if engine.disposed() {
      break;
    }
    drain(&engine);
  }
  tracing::trace!(index, "reaper exiting");
}

/// Boss step: publish staged entries, decide whether to park, enter
/// the kernel. Blocks until a completion or an eventfd write when
/// parked.
fn synchronize(engine: &Arc<Engine>) {
  arm_unblock(engine);

  let (in_flight, should_enter, mut flags, parked) = {
    let mut queue = engine.sq.lock();
    queue.should_unblock = false;
    let in_flight = queue.notify();
    let (should_enter, flags) = queue.should_enter();
    // Park only when nothing is in flight from the kernel's point of
    // view and the unblock read is there to be completed by a
    // producer's wakeup write.
    let parked = in_flight == 0
      && engine.unblock.is_armed()
      && !engine.disposed();
    if parked {
      queue.should_unblock = true;
    }
    (in_flight, should_enter, flags, parked)
  };

  let min_complete =
    if parked && engine.cq.is_empty() { 1 } else { 0 };
  if !should_enter && min_complete == 0 {
    return;
  }
  if min_complete > 0 || engine.cq.io_polled() {
    flags |= params::ENTER_GETEVENTS;
  }

  match enter_loop(&engine.ring, in_flight, min_complete, flags) {
    Ok(Submit::Entered(count)) => {
      tracing::trace!(in_flight, min_complete, parked, count, "entered");
    }
    Ok(Submit::Skipped) | Ok(Submit::AwaitCompletions) => {}
    Err(error) => engine.fail(error),
  }
}

/// Post-barrier step, run by every reaper: claim completions one at a
/// time and dispatch them until the queue reads empty.
fn drain(engine: &Arc<Engine>) {
  loop {
    match engine.cq.try_read() {
      Ok(Some(cqe)) => complete(engine, cqe),
      Ok(None) => break,
      Err(error) => {
        engine.fail(error);
        break;
      }
    }
  }
}

fn complete(engine: &Arc<Engine>, cqe: Cqe) {
  let token = cqe.user_data;
  let wake_read =
    token == engine.unblock_token.load(Ordering::Acquire);
  if wake_read {
    engine.unblock.set_unarmed();
  }

  let Some(mut record) = engine.store.remove(token) else {
    tracing::warn!(token, res = cqe.res, "completion without registry entry");
    return;
  };

  if engine.asynchronous && !wake_read {
    record.result = cqe.res;
    engine
      .dispatcher
      .as_ref()
      .expect("asynchronous ring without dispatcher")
      .dispatch(record);
  } else {
    // The wake read's re-arm callback always runs inline so the boss
    // is never left waiting on a dispatch worker to restore parking.
    let callback = record
      .callback
      .take()
      .expect("pending record without callback");
    callback.call(cqe.res);
    engine.store.release(record);
  }
}
