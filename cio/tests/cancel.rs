use cio::{Config, Ring, SqeFlags, Timespec};
use std::sync::mpsc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(2);

#[test]
fn short_timeout_expires_on_its_own() {
  static SHORT: Timespec = Timespec { tv_sec: 0, tv_nsec: 20_000_000 };

  let ring = Ring::new(Config::new(8)).unwrap();
  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .timeout(&SHORT, 0, 0, SqeFlags::NONE, move |res| {
        tx.send(res).unwrap()
      })
      .unwrap();
  }
  assert_eq!(rx.recv_timeout(DEADLINE).unwrap(), -libc::ETIME);
}

#[test]
fn cancel_lands_on_a_pending_timeout() {
  static LONG: Timespec = Timespec { tv_sec: 60, tv_nsec: 0 };

  let ring = Ring::new(Config::new(8)).unwrap();

  let (victim_tx, victim_rx) = mpsc::channel();
  let token = unsafe {
    ring
      .timeout(&LONG, 0, 0, SqeFlags::NONE, move |res| {
        victim_tx.send(res).unwrap()
      })
      .unwrap()
  };
  // Give the boss a chance to hand the timeout to the kernel before
  // aiming the cancel at it.
  std::thread::sleep(Duration::from_millis(20));

  let (cancel_tx, cancel_rx) = mpsc::channel();
  ring
    .cancel(token, SqeFlags::NONE, move |res| {
      cancel_tx.send(res).unwrap()
    })
    .unwrap();

  // The victim fires with its own result, well before the hour is up.
  let victim_res = victim_rx.recv_timeout(DEADLINE).unwrap();
  assert!(
    victim_res == -libc::ECANCELED || victim_res == -libc::ETIME,
    "unexpected victim result {victim_res}"
  );
  // The cancel's completion reports whether it landed.
  let cancel_res = cancel_rx.recv_timeout(DEADLINE).unwrap();
  assert!(
    cancel_res == 0 || cancel_res == -libc::ENOENT,
    "unexpected cancel result {cancel_res}"
  );
}

#[test]
fn timeout_remove_clears_a_pending_timeout() {
  static LONG: Timespec = Timespec { tv_sec: 60, tv_nsec: 0 };

  let ring = Ring::new(Config::new(8)).unwrap();

  let (victim_tx, victim_rx) = mpsc::channel();
  let token = unsafe {
    ring
      .timeout(&LONG, 0, 0, SqeFlags::NONE, move |res| {
        victim_tx.send(res).unwrap()
      })
      .unwrap()
  };
  std::thread::sleep(Duration::from_millis(20));

  let (remove_tx, remove_rx) = mpsc::channel();
  ring
    .timeout_remove(token, SqeFlags::NONE, move |res| {
      remove_tx.send(res).unwrap()
    })
    .unwrap();

  assert_eq!(
    victim_rx.recv_timeout(DEADLINE).unwrap(),
    -libc::ECANCELED
  );
  assert_eq!(remove_rx.recv_timeout(DEADLINE).unwrap(), 0);
}
