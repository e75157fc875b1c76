use cio::{Config, Ring, SqeFlags};
use cio_uring::sqe::FSYNC_DATASYNC;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(2);

fn scratch_path(tag: &str) -> std::path::PathBuf {
  std::env::temp_dir().join(format!("cio-{tag}-{}", std::process::id()))
}

#[test]
fn write_sync_then_read_back() {
  let path = scratch_path("rw");
  let file = std::fs::OpenOptions::new()
    .create(true)
    .truncate(true)
    .read(true)
    .write(true)
    .open(&path)
    .unwrap();
  let fd = file.as_raw_fd();

  let ring = Ring::new(Config::new(16)).unwrap();
  let payload = b"callback engines do files too".to_vec();

  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .write(
        fd,
        payload.as_ptr(),
        payload.len() as u32,
        0,
        SqeFlags::NONE,
        move |res| tx.send(res).unwrap(),
      )
      .unwrap();
  }
  assert_eq!(
    rx.recv_timeout(DEADLINE).unwrap(),
    payload.len() as i32
  );

  let (tx, rx) = mpsc::channel();
  ring
    .fsync(fd, FSYNC_DATASYNC, SqeFlags::NONE, move |res| {
      tx.send(res).unwrap()
    })
    .unwrap();
  assert_eq!(rx.recv_timeout(DEADLINE).unwrap(), 0);

  let mut readback = vec![0u8; payload.len()];
  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .read(
        fd,
        readback.as_mut_ptr(),
        readback.len() as u32,
        0,
        SqeFlags::NONE,
        move |res| tx.send(res).unwrap(),
      )
      .unwrap();
  }
  assert_eq!(
    rx.recv_timeout(DEADLINE).unwrap(),
    payload.len() as i32
  );
  assert_eq!(readback, payload);

  drop(file);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn vectored_write_gathers_both_buffers() {
  let path = scratch_path("writev");
  let file = std::fs::OpenOptions::new()
    .create(true)
    .truncate(true)
    .read(true)
    .write(true)
    .open(&path)
    .unwrap();
  let fd = file.as_raw_fd();

  let ring = Ring::new(Config::new(16)).unwrap();
  let head = b"scatter ".to_vec();
  let tail = b"gather".to_vec();
  let iov = [
    libc::iovec {
      iov_base: head.as_ptr() as *mut _,
      iov_len: head.len(),
    },
    libc::iovec {
      iov_base: tail.as_ptr() as *mut _,
      iov_len: tail.len(),
    },
  ];

  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .writev(fd, iov.as_ptr(), 2, 0, SqeFlags::NONE, move |res| {
        tx.send(res).unwrap()
      })
      .unwrap();
  }
  assert_eq!(
    rx.recv_timeout(DEADLINE).unwrap() as usize,
    head.len() + tail.len()
  );
  assert_eq!(std::fs::read(&path).unwrap(), b"scatter gather");

  drop(file);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn openat_write_close_through_the_ring() {
  let path = scratch_path("openat");
  let cpath = CString::new(path.to_str().unwrap()).unwrap();

  let ring = Ring::new(Config::new(16)).unwrap();

  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .openat(
        libc::AT_FDCWD,
        cpath.as_ptr(),
        libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
        0o600,
        SqeFlags::NONE,
        move |res| tx.send(res).unwrap(),
      )
      .unwrap();
  }
  let fd = rx.recv_timeout(DEADLINE).unwrap();
  assert!(fd >= 0, "openat failed: {fd}");

  let payload = b"opened by the ring".to_vec();
  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .write(
        fd,
        payload.as_ptr(),
        payload.len() as u32,
        0,
        SqeFlags::NONE,
        move |res| tx.send(res).unwrap(),
      )
      .unwrap();
  }
  assert_eq!(
    rx.recv_timeout(DEADLINE).unwrap(),
    payload.len() as i32
  );

  let (tx, rx) = mpsc::channel();
  ring
    .close_fd(fd, SqeFlags::NONE, move |res| tx.send(res).unwrap())
    .unwrap();
  assert_eq!(rx.recv_timeout(DEADLINE).unwrap(), 0);

  assert_eq!(std::fs::read(&path).unwrap(), payload);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn read_reports_kernel_errors_verbatim() {
  let ring = Ring::new(Config::new(8)).unwrap();

  // read(2) on a directory fails with EISDIR; the callback sees the
  // negated errno untouched.
  let dir = std::fs::File::open("/").unwrap();

  let mut buf = [0u8; 8];
  let (tx, rx) = mpsc::channel();
  unsafe {
    ring
      .read(
        dir.as_raw_fd(),
        buf.as_mut_ptr(),
        buf.len() as u32,
        0,
        SqeFlags::NONE,
        move |res| tx.send(res).unwrap(),
      )
      .unwrap();
  }
  assert_eq!(rx.recv_timeout(DEADLINE).unwrap(), -libc::EISDIR);
}
