use thiserror::Error;

/// Failures surfaced by the ring.
///
/// Kernel results delivered to completion callbacks are *not* errors at
/// this level; callbacks receive the raw `i32` (negative errno included)
/// and own its interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
  /// The submission queue has no room for the requested staging. The
  /// operation was not staged and no token was issued.
  #[error("submission queue full")]
  SubmissionQueueFull,

  /// The kernel dropped completions because the CQ was not drained in
  /// time. Terminal: pending callbacks may never fire, so the ring
  /// disposes itself.
  #[error("completion queue overflow")]
  CompletionQueueOverflow,

  /// The ring has been disposed.
  #[error("ring disposed")]
  Disposed,

  /// A syscall failed with the contained errno.
  #[error("syscall failed with errno {0}")]
  Errno(i32),
}

impl From<std::io::Error> for RingError {
  fn from(err: std::io::Error) -> RingError {
    RingError::Errno(err.raw_os_error().unwrap_or(libc::EIO))
  }
}
