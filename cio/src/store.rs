//! Pending-operation registry and record pool.
//!
//! Tokens are assigned by the submission queue adapter at staging time;
//! the store only maps them to their operation records. A record is
//! reachable from exactly one place at a time: the registry while the
//! operation is in flight, the dispatch path while its callback runs,
//! or the freelist in between.

use crossbeam_queue::ArrayQueue;

use crate::callback::OpCallback;

/// A reusable operation record.
///
/// `result` is only meaningful while the record travels to a dispatch
/// worker; inline dispatch passes the kernel result straight through.
#[derive(Default)]
pub(crate) struct OpRecord {
  pub callback: Option<OpCallback>,
  pub result: i32,
}

pub(crate) struct OpStore {
  pending: scc::HashMap<u64, OpRecord>,
  free: ArrayQueue<OpRecord>,
}

impl OpStore {
  pub fn with_capacity(cap: usize) -> OpStore {
    OpStore {
      pending: scc::HashMap::with_capacity(cap),
      free: ArrayQueue::new(cap.max(1)),
    }
  }

  /// Register a staged operation under its token.
  ///
  /// Tokens are unique while live by construction; a duplicate means
  /// the documented fd-reuse collision fired, in which case the newer
  /// operation's completion would be misdirected.
  pub fn insert(&self, token: u64, callback: OpCallback) {
    let mut record = self.free.pop().unwrap_or_default();
    record.callback = Some(callback);
    record.result = 0;
    if self.pending.insert(token, record).is_err() {
      debug_assert!(false, "duplicate live token {token:#x}");
      tracing::warn!(token, "duplicate live token; dropping new record");
    }
  }

  /// Claim the record for a completed token. Exactly one reaper wins.
  pub fn remove(&self, token: u64) -> Option<OpRecord> {
    self.pending.remove(&token).map(|(_, record)| record)
  }

  /// Return a record to the freelist once its callback has run.
  pub fn release(&self, mut record: OpRecord) {
    record.callback = None;
    record.result = 0;
    // A full freelist just means the record is dropped.
    let _ = self.free.push(record);
  }

  /// Number of staged-but-not-yet-completed operations.
  pub fn pending(&self) -> usize {
    self.pending.len()
  }

  /// Drop every pending record. Disposal only: un-fired callbacks are
  /// released, not invoked.
  pub fn clear(&self) {
    self.pending.retain(|_, _| false);
  }

  #[cfg(test)]
  fn pooled(&self) -> usize {
    self.free.len()
  }
}
