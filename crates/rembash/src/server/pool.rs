//! Fixed-size worker pool.
//!
//! The event loop hands ready descriptor numbers to the pool; worker threads
//! run the per-state handler. One-shot registration guarantees at most one
//! outstanding event per descriptor, so workers never race on the same fd.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::info;

pub struct WorkerPool {
  tx: Sender<RawFd>,
  _workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  /// Spawns `size` worker threads that run `handler` for every dispatched
  /// descriptor. The pool lives for the rest of the process; there is no
  /// shutdown path because the event loop never returns.
  pub fn start<F>(size: usize, handler: F) -> Result<Self>
  where
    F: Fn(RawFd) + Send + Sync + 'static,
  {
    let handler = Arc::new(handler);
    let (tx, rx) = unbounded::<RawFd>();
    let mut workers = Vec::with_capacity(size);
    for i in 0..size {
      let rx: Receiver<RawFd> = rx.clone();
      let handler = Arc::clone(&handler);
      let worker = thread::Builder::new()
        .name(format!("relay-worker-{i}"))
        .spawn(move || {
          while let Ok(fd) = rx.recv() {
            handler(fd);
          }
        })
        .context("spawn relay worker thread")?;
      workers.push(worker);
    }
    info!("Worker pool started with {size} threads");
    Ok(Self {
      tx,
      _workers: workers,
    })
  }

  /// Queues a descriptor for handling. Never blocks.
  pub fn dispatch(&self, fd: RawFd) {
    let _ = self.tx.send(fd);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::{Duration, Instant};

  #[test]
  fn every_dispatched_task_runs() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    let pool = WorkerPool::start(4, move |_fd| {
      seen.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    for fd in 0..100 {
      pool.dispatch(fd);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < 100 {
      assert!(Instant::now() < deadline, "pool did not drain in time");
      thread::sleep(Duration::from_millis(10));
    }
  }

  #[test]
  fn tasks_for_different_fds_run_in_parallel() {
    // Two tasks that each wait for the other to start can only finish if at
    // least two workers are live.
    let started = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&started);
    let pool = WorkerPool::start(2, move |_fd| {
      observed.fetch_add(1, Ordering::SeqCst);
      let deadline = Instant::now() + Duration::from_secs(5);
      while observed.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
      }
    })
    .unwrap();

    pool.dispatch(1);
    pool.dispatch(2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while started.load(Ordering::SeqCst) < 2 {
      assert!(Instant::now() < deadline, "tasks did not overlap");
      thread::sleep(Duration::from_millis(10));
    }
  }
}
