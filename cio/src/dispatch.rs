//! Worker pool for asynchronous continuation dispatch.
//!
//! When the ring runs with `run_continuations_asynchronously`, reapers
//! stash the kernel result in the operation record and hand it to this
//! pool; a worker invokes the callback and returns the record to the
//! operation pool. Inline dispatch bypasses this module entirely.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::store::{OpRecord, OpStore};

pub(crate) struct Dispatcher {
  tx: Mutex<Option<Sender<OpRecord>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
  pub fn spawn(threads: usize, store: Arc<OpStore>) -> Dispatcher {
    let (tx, rx) = crossbeam_channel::unbounded::<OpRecord>();
    let workers = (0..threads.max(1))
      .map(|index| {
        let rx = rx.clone();
        let store = Arc::clone(&store);
        thread::Builder::new()
          .name(format!("cio-dispatch-{index}"))
          .spawn(move || worker_loop(rx, store))
          .expect("failed to spawn dispatch worker")
      })
      .collect();
    Dispatcher { tx: Mutex::new(Some(tx)), workers: Mutex::new(workers) }
  }

  /// Hand a completed record (callback + cached result) to a worker.
  pub fn dispatch(&self, record: OpRecord) {
    if let Some(tx) = self.tx.lock().as_ref() {
      // A send can only fail after shutdown; the record is then dropped
      // and its callback released un-fired.
      let _ = tx.send(record);
    }
  }

  /// Close the feed, drain queued work, and join the workers.
  pub fn shutdown(&self) {
    drop(self.tx.lock().take());
    for handle in self.workers.lock().drain(..) {
      let _ = handle.join();
    }
  }
}

fn worker_loop(rx: Receiver<OpRecord>, store: Arc<OpStore>) {
  for mut record in rx.iter() {
    let callback = record
      .callback
      .take()
      .expect("dispatched record without callback");
    callback.call(record.result);
    store.release(record);
  }
  tracing::trace!("dispatch worker exiting");
}
