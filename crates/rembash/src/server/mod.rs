//! Server core: process-wide setup and the event loop.
//!
//! One thread waits on the main epoll instance and classifies readiness; a
//! fixed worker pool runs the per-state handlers. All process state lives in
//! a single [`Server`] context threaded through the components; only the
//! signal policy is process-global.
//!
//! High-level flow:
//! - Listening-socket readiness drains the accept queue; each new connection
//!   gets a greeting, an expiration timer, and a one-shot registration.
//! - Client readiness while `NEW` runs the handshake; success commissions a
//!   PTY and shell and flips the connection to `ESTABLISHED`.
//! - Readiness on either relay descriptor moves bytes toward its peer,
//!   buffering the unwritten suffix in the record on backpressure.
//! - Error/hang-up flags, EOF, timer expiry, and relay failures all converge
//!   on the same idempotent teardown.

pub mod acceptor;
pub mod conn;
pub mod handshake;
pub mod poller;
pub mod pool;
pub mod relay;
pub mod shell;
pub mod timers;

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::epoll::{EpollEvent, EpollFlags};
use nix::sys::signal::{SigHandler, Signal, signal};

use crate::config::ServeConfig;
use crate::server::conn::{ConnTable, Connection, Phase};
use crate::server::poller::{Interest, Poller};
use crate::server::pool::WorkerPool;
use crate::server::timers::HandshakeTimers;

pub struct Server {
  pub(crate) config: ServeConfig,
  pub(crate) listener: TcpListener,
  pub(crate) poller: Poller,
  pub(crate) timers: HandshakeTimers,
  pub(crate) conns: ConnTable,
}

impl Server {
  /// Process-wide initialization: signal policy, listening socket, the two
  /// epoll instances, and their cross-registrations. Fails fatally; nothing
  /// here is recoverable per connection.
  pub fn bind(config: ServeConfig) -> Result<Arc<Self>> {
    install_signal_policy()?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
      .with_context(|| format!("bind TCP listener on port {}", config.port))?;
    listener
      .set_nonblocking(true)
      .context("set listener nonblocking")?;

    let poller = Poller::new()?;
    let timers = HandshakeTimers::new(config.handshake_timeout)?;
    poller.add(timers.as_raw_fd(), Interest::INPUT)?;
    poller.add(listener.as_raw_fd(), Interest::INPUT)?;

    Ok(Arc::new(Self {
      config,
      listener,
      poller,
      timers,
      conns: ConnTable::default(),
    }))
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    self.listener.local_addr().context("query listener address")
  }

  /// The event loop. Never returns during normal operation.
  pub fn run(self: &Arc<Self>) -> Result<()> {
    let pool = WorkerPool::start(self.config.workers, {
      let server = Arc::clone(self);
      move |fd| server.handle_ready(fd)
    })?;
    info!(
      "Listening on {} ({} workers, {}s handshake timeout)",
      self.local_addr()?,
      self.config.workers,
      self.config.handshake_timeout.as_secs()
    );

    let listener_fd = self.listener.as_raw_fd();
    let timers_fd = self.timers.as_raw_fd();
    let mut events = vec![EpollEvent::empty(); 64];
    loop {
      let ready = self.poller.wait(&mut events)?;
      for event in &events[..ready] {
        let fd = event.data() as RawFd;
        if fd == listener_fd || fd == timers_fd {
          pool.dispatch(fd);
          continue;
        }
        let flags = event.events();
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
          if let Some(conn) = self.conns.get(fd) {
            debug!("Descriptor {fd} reported {flags:?}; terminating connection");
            // Teardown only closes descriptors no worker is reading from or
            // writing to; anything busy or pinned is closed by that worker
            // when it drops its mark, exactly as `finish` does.
            self.teardown(&conn);
          }
          continue;
        }
        let Some(conn) = self.conns.get(fd) else {
          continue;
        };
        {
          let mut inner = conn.lock();
          if inner.phase == Phase::Terminated || inner.busy(fd) {
            continue;
          }
          inner.set_busy(fd, true);
        }
        pool.dispatch(fd);
      }
    }
  }

  /// Worker-side entry point for one readiness event.
  fn handle_ready(&self, fd: RawFd) {
    if fd == self.listener.as_raw_fd() {
      acceptor::drain(self);
      return;
    }
    if fd == self.timers.as_raw_fd() {
      self.expire_timers();
      return;
    }

    let Some(conn) = self.conns.get(fd) else {
      return;
    };
    let phase = {
      let inner = conn.lock();
      if !inner.busy(fd) {
        // Stale queue entry for a recycled descriptor number; the event
        // loop never marked this record.
        return;
      }
      inner.phase
    };
    match phase {
      Phase::New => handshake::admit(self, &conn),
      Phase::Established => relay::service(self, &conn, fd),
      Phase::Terminated => {}
    }
    self.finish(&conn, fd);
  }

  /// Clears the busy mark and either rearms the descriptor from current
  /// state or, if the connection died while we were servicing it, performs
  /// the close this worker deferred. The interest is applied under the
  /// connection lock so two workers cannot interleave stale masks.
  fn finish(&self, conn: &Arc<Connection>, fd: RawFd) {
    let mut inner = conn.lock();
    inner.set_busy(fd, false);
    if inner.phase == Phase::Terminated {
      // The peer's worker may still be pinning this descriptor for a
      // cross-write; whoever clears the last mark closes it.
      let owner = if inner.releasable(fd) {
        inner.take_owner(fd)
      } else {
        None
      };
      drop(inner);
      if owner.is_some() {
        self.conns.remove(fd);
      }
      return;
    }
    let interest = inner.interest_of(fd);
    if (interest.input || interest.output) && self.poller.rearm(fd, interest).is_err() {
      drop(inner);
      warn!("Failed to rearm descriptor {fd}; terminating connection");
      self.teardown(conn);
    }
  }

  /// Arms `fd` from current state unless a worker owns it, in which case
  /// that worker's own finishing rearm will pick the interest up.
  pub(crate) fn arm_if_idle(&self, conn: &Arc<Connection>, fd: RawFd) {
    let inner = conn.lock();
    if inner.phase == Phase::Terminated || inner.busy(fd) {
      return;
    }
    let interest = inner.interest_of(fd);
    if (interest.input || interest.output) && self.poller.rearm(fd, interest).is_err() {
      drop(inner);
      warn!("Failed to arm peer descriptor {fd}; terminating connection");
      self.teardown(conn);
    }
  }

  /// Pins `fd` so a cross-write to it cannot race a concurrent teardown
  /// closing it. Fails when the connection is no longer established.
  pub(crate) fn pin(&self, conn: &Arc<Connection>, fd: RawFd) -> bool {
    let mut inner = conn.lock();
    if inner.phase != Phase::Established {
      return false;
    }
    inner.set_pinned(fd, true);
    true
  }

  /// Drops a pin and, if the connection died while the write was in
  /// flight, performs the close that teardown deferred to us.
  pub(crate) fn unpin(&self, conn: &Arc<Connection>, fd: RawFd) {
    let owner = {
      let mut inner = conn.lock();
      inner.set_pinned(fd, false);
      if inner.phase == Phase::Terminated && inner.releasable(fd) {
        inner.take_owner(fd)
      } else {
        None
      }
    };
    if owner.is_some() {
      self.conns.remove(fd);
    }
  }

  /// Idempotent teardown. Closes the descriptors no worker holds now and
  /// leaves a busy or pinned descriptor to the worker holding it; closing
  /// removes each from its epoll instance. The record drops once every
  /// holder lets go of the Arc.
  pub(crate) fn teardown(&self, conn: &Arc<Connection>) {
    let idle = {
      let mut inner = conn.lock();
      if inner.phase == Phase::Terminated {
        return;
      }
      inner.phase = Phase::Terminated;
      inner.take_idle_owners()
    };
    self.timers.cancel(conn);
    for (fd, owner) in idle {
      self.conns.remove(fd);
      drop(owner);
    }
    debug!("Connection {} terminated", conn.client_fd());
  }

  fn expire_timers(&self) {
    for conn in self.timers.expirations() {
      info!(
        "Client {} did not complete the handshake in time",
        conn.client_fd()
      );
      self.teardown(&conn);
    }
    if let Err(err) = self.poller.rearm(self.timers.as_raw_fd(), Interest::INPUT) {
      error!("Failed to rearm timer instance: {err:#}");
    }
  }
}

/// Children are reaped by the kernel and a disconnecting client must not
/// kill the process with SIGPIPE.
fn install_signal_policy() -> Result<()> {
  unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.context("ignore SIGCHLD")?;
  unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;
  Ok(())
}
