//! Handshake expiration timers.
//!
//! Every accepted connection gets a one-shot monotonic timerfd. The timers
//! are registered with a dedicated epoll instance which in turn is a single
//! readable source on the main instance, so the event loop sees all
//! expirations as one aggregate descriptor and no per-thread signal plumbing
//! is needed.
//!
//! A successful handshake cancels the timer by closing its descriptor; the
//! kernel removes it from the timer instance on close. Descriptor numbers
//! are recycled, so the expiration handler confirms expiry by reading the
//! timerfd counter before acting: a stale readiness for a recycled number
//! reads `EAGAIN` and is ignored.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use nix::sys::epoll::EpollEvent;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use parking_lot::Mutex;

use crate::server::conn::Connection;
use crate::server::poller::{Interest, Poller};

pub struct HandshakeTimers {
  poller: Poller,
  owners: Mutex<HashMap<RawFd, Arc<Connection>>>,
  timeout: Duration,
}

impl HandshakeTimers {
  pub fn new(timeout: Duration) -> Result<Self> {
    Ok(Self {
      poller: Poller::new().context("create timer epoll instance")?,
      owners: Mutex::new(HashMap::new()),
      timeout,
    })
  }

  /// Raw descriptor of the timer epoll instance, registered as an input
  /// source on the main instance.
  #[must_use]
  pub fn as_raw_fd(&self) -> RawFd {
    self.poller.as_raw_fd()
  }

  /// Arms an expiration timer for `conn` and stores the timer descriptor in
  /// the connection record. Must be called while the connection is still
  /// unregistered with the main instance, so admission cannot outrun its
  /// own timer.
  pub fn arm(&self, conn: &Arc<Connection>) -> Result<()> {
    let timer = TimerFd::new(
      ClockId::CLOCK_MONOTONIC,
      TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
    )
    .context("create handshake timerfd")?;
    timer
      .set(
        Expiration::OneShot(TimeSpec::from_duration(self.timeout)),
        TimerSetTimeFlags::empty(),
      )
      .context("arm handshake timerfd")?;

    let timer_fd = timer.as_fd().as_raw_fd();
    self.poller.add(timer_fd, Interest::INPUT)?;
    self.owners.lock().insert(timer_fd, Arc::clone(conn));
    conn.lock().timer = Some(timer);
    debug!(
      "Handshake timer {timer_fd} armed for client {}",
      conn.client_fd()
    );
    Ok(())
  }

  /// Cancels the timer after a successful handshake. Closing the descriptor
  /// disarms it and removes it from the timer instance.
  pub fn cancel(&self, conn: &Arc<Connection>) {
    let timer = conn.lock().timer.take();
    if let Some(timer) = timer {
      let timer_fd = timer.as_fd().as_raw_fd();
      self.owners.lock().remove(&timer_fd);
      drop(timer);
      debug!("Handshake timer {timer_fd} cancelled");
    }
  }

  /// Collects connections whose timers have genuinely expired. Each one is
  /// forgotten here; the caller tears it down (which also closes the timer
  /// descriptor it still owns).
  pub fn expirations(&self) -> Vec<Arc<Connection>> {
    let mut expired = Vec::new();
    let mut events = [EpollEvent::empty(); 32];
    loop {
      let n = match self.poller.poll(&mut events) {
        Ok(0) | Err(_) => break,
        Ok(n) => n,
      };
      for event in &events[..n] {
        let timer_fd = event.data() as RawFd;
        let conn = match self.owners.lock().get(&timer_fd).cloned() {
          Some(conn) => conn,
          None => continue,
        };
        if !timer_has_fired(&conn) {
          continue;
        }
        self.owners.lock().remove(&timer_fd);
        expired.push(conn);
      }
      if n < events.len() {
        break;
      }
    }
    expired
  }
}

/// Reads the expiration counter from the connection's own timer. `EAGAIN`
/// means the readiness belonged to an earlier timer that shared the
/// descriptor number.
fn timer_has_fired(conn: &Arc<Connection>) -> bool {
  let inner = conn.lock();
  let Some(timer) = inner.timer.as_ref() else {
    return false;
  };
  let mut count = [0u8; 8];
  matches!(nix::unistd::read(timer.as_fd(), &mut count), Ok(8))
}
