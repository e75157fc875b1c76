//! Type-erased completion callbacks.

use std::mem::ManuallyDrop;

/// An owned `(state, fn)` pair invoked with the kernel result.
///
/// The closure is boxed once at submission time and erased behind plain
/// function pointers so operation records stay a fixed size. Calling
/// consumes the callback; a callback dropped without being called (a
/// rejected staging, ring disposal) still frees its state.
pub(crate) struct OpCallback {
  state: *mut (),
  call_fn: unsafe fn(*mut (), i32),
  drop_fn: unsafe fn(*mut ()),
}

// SAFETY: construction requires `F: Send`, and the raw parts are only
// ever used from one thread at a time.
unsafe impl Send for OpCallback {}
// SAFETY: the store's design guarantees a record is reachable from
// exactly one place (thread) at a time, so shared references across
// threads never lead to concurrent access to the raw parts.
unsafe impl Sync for OpCallback {}

impl OpCallback {
  pub fn new<F>(callback: F) -> OpCallback
  where
    F: FnOnce(i32) + Send + 'static,
  {
    unsafe fn call_impl<F: FnOnce(i32)>(state: *mut (), res: i32) {
      // SAFETY: `state` came from `Box::into_raw` of an `F` and is
      // consumed exactly once.
      let callback = unsafe { Box::from_raw(state as *mut F) };
      callback(res);
    }
    unsafe fn drop_impl<F>(state: *mut ()) {
      // SAFETY: as above; dropping without calling.
      drop(unsafe { Box::from_raw(state as *mut F) });
    }
    OpCallback {
      state: Box::into_raw(Box::new(callback)) as *mut (),
      call_fn: call_impl::<F>,
      drop_fn: drop_impl::<F>,
    }
  }

  /// Invoke the callback with the kernel result, consuming it.
  pub fn call(self, res: i32) {
    let this = ManuallyDrop::new(self);
    // SAFETY: ManuallyDrop suppresses the Drop path, so the state is
    // consumed exactly once, here.
    unsafe { (this.call_fn)(this.state, res) }
  }
}

impl Drop for OpCallback {
  fn drop(&mut self) {
    // SAFETY: the state has not been consumed (call() forgets self).
    unsafe { (self.drop_fn)(self.state) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
  use std::sync::Arc;

  #[test]
  fn call_passes_result_through() {
    let seen = Arc::new(AtomicI32::new(0));
    let cb = {
      let seen = Arc::clone(&seen);
      OpCallback::new(move |res| seen.store(res, Ordering::SeqCst))
    };
    cb.call(-libc::ECANCELED);
    assert_eq!(seen.load(Ordering::SeqCst), -libc::ECANCELED);
  }

  #[test]
  fn dropping_uncalled_releases_state() {
    struct Guard(Arc<AtomicBool>);
    impl Drop for Guard {
      fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
      }
    }

    let dropped = Arc::new(AtomicBool::new(false));
    let guard = Guard(Arc::clone(&dropped));
    let cb = OpCallback::new(move |_| {
      let _keep = &guard;
      unreachable!("never invoked");
    });
    drop(cb);
    assert!(dropped.load(Ordering::SeqCst));
  }

  #[test]
  fn call_is_send_across_threads() {
    let (tx, rx) = std::sync::mpsc::channel();
    let cb = OpCallback::new(move |res| tx.send(res).unwrap());
    std::thread::spawn(move || cb.call(7)).join().unwrap();
    assert_eq!(rx.recv().unwrap(), 7);
  }
}
