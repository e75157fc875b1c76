//! # cio
//!
//! A thread-safe io_uring submission engine with callback completion
//! dispatch.
//!
//! Any number of producer threads stage operations against one kernel
//! ring; staging is a short critical section that never enters the
//! kernel. A pool of reaper threads (configurable, N ≥ 1) drives the
//! submit/reap cycle: each round, one boss reaper publishes staged
//! entries and performs `io_uring_enter`, then every reaper drains
//! completions in parallel and dispatches callbacks — inline, or on a
//! background worker pool.
//!
//! A parked boss (blocked in the kernel waiting for a completion) is
//! woken by producers through an eventfd whose read is kept permanently
//! pending inside the ring, so fresh submissions never wait on a
//! timeout.
//!
//! ```rust,no_run
//! use cio::{Config, Ring, SqeFlags};
//! use std::sync::mpsc;
//!
//! # fn main() -> Result<(), cio::RingError> {
//! let ring = Ring::new(Config::new(64).completion_threads(2))?;
//!
//! let (tx, rx) = mpsc::channel();
//! let token = ring.nop(SqeFlags::NONE, move |res| {
//!   tx.send(res).unwrap();
//! })?;
//! assert_eq!(rx.recv().unwrap(), 0);
//! println!("nop {token:#x} completed");
//!
//! ring.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! Operations that carry raw pointers (reads, writes, socket
//! addresses, timespecs) are `unsafe` to submit: every referenced
//! buffer must outlive the completion callback. Tokens returned by the
//! submit entry points feed [`Ring::cancel`], [`Ring::poll_remove`]
//! and [`Ring::timeout_remove`].

mod callback;
mod cqueue;
mod dispatch;
mod error;
mod reaper;
mod ring;
mod squeue;
mod store;
mod unblock;

pub use cio_uring::opcode;
pub use cio_uring::sqe::{Sqe, SqeFlags, Timespec};
pub use cio_uring::Builder as RingOptions;
pub use error::RingError;
pub use ring::{Config, Prepared, Ring};
