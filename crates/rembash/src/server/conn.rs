//! Connection records and the descriptor table.
//!
//! A `Connection` owns up to three descriptors: the accepted client socket,
//! the PTY master (after admission), and the handshake timer (until
//! admission). The table maps both relay descriptors to the same record;
//! peer lookup and state live behind one short-scope mutex per connection.
//!
//! Invariants:
//! - A direction is stalled iff its pending buffer is non-empty; interest is
//!   always derived from the two buffers plus the phase, never stored.
//! - `busy` marks are set by the event loop before dispatch and cleared by
//!   the servicing worker, so at most one worker handles a descriptor's
//!   events and a stale dispatch for a recycled descriptor number finds its
//!   mark unset. A worker's own descriptor is covered by its busy mark for
//!   reads and backlog drains alike.
//! - A worker about to write across the bridge pins the peer descriptor
//!   first and unpins it when the write is done. Pinning does not block
//!   dispatch; it only keeps the descriptor open.
//! - Each descriptor is closed exactly once, and never while a syscall on
//!   it is in flight: teardown takes the owners of descriptors that are
//!   neither busy nor pinned, and whichever worker clears the last mark on
//!   a terminated connection performs the deferred close.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::sys::timerfd::TimerFd;
use parking_lot::Mutex;

use crate::config::MAX_HANDSHAKE_LINE;
use crate::protocol::LineBuffer;
use crate::server::poller::Interest;

/// Lifecycle of a connection. Per-direction stalls are not a phase; each
/// direction tracks its own backlog in a [`Pending`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Accepted, greeting sent, waiting for the secret.
  New,
  /// Admitted and bridged to a shell.
  Established,
  /// Torn down; the record only waits for busy workers to drop their fds.
  Terminated,
}

/// Owned backlog of bytes read from one side but not yet written to the
/// other. Holding a copy (never a pointer into a worker's stack buffer)
/// keeps the bytes alive across dispatches.
#[derive(Debug, Default)]
pub struct Pending {
  buf: Vec<u8>,
  off: usize,
}

impl Pending {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.off >= self.buf.len()
  }

  /// Stores the unwritten suffix of a relay read.
  pub fn load(&mut self, bytes: &[u8]) {
    self.buf.clear();
    self.buf.extend_from_slice(bytes);
    self.off = 0;
  }

  /// Marks `n` more bytes as written.
  pub fn advance(&mut self, n: usize) {
    self.off += n;
    if self.is_empty() {
      self.clear();
    }
  }

  #[must_use]
  pub fn remaining(&self) -> &[u8] {
    &self.buf[self.off.min(self.buf.len())..]
  }

  pub fn clear(&mut self) {
    self.buf.clear();
    self.off = 0;
  }
}

/// Mutable state of a connection, guarded by `Connection::inner`.
pub struct Inner {
  pub phase: Phase,
  client_fd: RawFd,
  master_fd: Option<RawFd>,
  client: Option<OwnedFd>,
  master: Option<OwnedFd>,
  pub timer: Option<TimerFd>,
  /// Partial secret line carried across handshake reads.
  pub greeting: LineBuffer,
  /// Bytes read from the client, waiting for the master to accept them.
  to_master: Pending,
  /// Bytes read from the master, waiting for the client to accept them.
  to_client: Pending,
  busy_client: bool,
  busy_master: bool,
  pinned_client: bool,
  pinned_master: bool,
}

impl Inner {
  #[must_use]
  pub fn is_client(&self, fd: RawFd) -> bool {
    fd == self.client_fd
  }

  /// The other end of the bridge. Only meaningful once the master exists.
  #[must_use]
  pub fn peer_of(&self, fd: RawFd) -> Option<RawFd> {
    if self.is_client(fd) {
      self.master_fd
    } else {
      Some(self.client_fd)
    }
  }

  /// Backlog whose write target is `fd`.
  pub fn pending_toward(&mut self, fd: RawFd) -> &mut Pending {
    if self.is_client(fd) {
      &mut self.to_client
    } else {
      &mut self.to_master
    }
  }

  #[must_use]
  pub fn busy(&self, fd: RawFd) -> bool {
    if self.is_client(fd) {
      self.busy_client
    } else {
      self.busy_master
    }
  }

  pub fn set_busy(&mut self, fd: RawFd, busy: bool) {
    if self.is_client(fd) {
      self.busy_client = busy;
    } else {
      self.busy_master = busy;
    }
  }

  #[must_use]
  pub fn pinned(&self, fd: RawFd) -> bool {
    if self.is_client(fd) {
      self.pinned_client
    } else {
      self.pinned_master
    }
  }

  pub fn set_pinned(&mut self, fd: RawFd, pinned: bool) {
    if self.is_client(fd) {
      self.pinned_client = pinned;
    } else {
      self.pinned_master = pinned;
    }
  }

  /// True when no worker is reading, draining, or cross-writing on `fd`,
  /// i.e. closing it now cannot race an in-flight syscall.
  #[must_use]
  pub fn releasable(&self, fd: RawFd) -> bool {
    !self.busy(fd) && !self.pinned(fd)
  }

  /// Readiness `fd` should be armed for, derived from phase and backlogs.
  #[must_use]
  pub fn interest_of(&self, fd: RawFd) -> Interest {
    let outbound_clear = if self.is_client(fd) {
      self.to_master.is_empty()
    } else {
      self.to_client.is_empty()
    };
    let inbound_pending = if self.is_client(fd) {
      !self.to_client.is_empty()
    } else {
      !self.to_master.is_empty()
    };
    derive_interest(self.phase, outbound_clear, inbound_pending)
  }

  /// Records the PTY master after admission.
  pub fn install_master(&mut self, master: OwnedFd) {
    self.master_fd = Some(master.as_raw_fd());
    self.master = Some(master);
  }

  /// Releases the owner of `fd` for closing, if still held.
  pub fn take_owner(&mut self, fd: RawFd) -> Option<OwnedFd> {
    if self.is_client(fd) {
      self.client.take()
    } else {
      self.master.take()
    }
  }

  /// Descriptors no worker is touching, for teardown to close. Busy or
  /// pinned ones stay behind for the worker that holds the mark.
  pub fn take_idle_owners(&mut self) -> Vec<(RawFd, OwnedFd)> {
    let mut idle = Vec::new();
    if self.releasable(self.client_fd)
      && let Some(fd) = self.client.take()
    {
      idle.push((self.client_fd, fd));
    }
    if let Some(raw) = self.master_fd
      && self.releasable(raw)
      && let Some(fd) = self.master.take()
    {
      idle.push((raw, fd));
    }
    idle
  }
}

pub struct Connection {
  client_fd: RawFd,
  inner: Mutex<Inner>,
}

impl Connection {
  #[must_use]
  pub fn new(client: OwnedFd) -> Arc<Self> {
    let client_fd = client.as_raw_fd();
    Arc::new(Self {
      client_fd,
      inner: Mutex::new(Inner {
        phase: Phase::New,
        client_fd,
        master_fd: None,
        client: Some(client),
        master: None,
        timer: None,
        greeting: LineBuffer::with_limit(MAX_HANDSHAKE_LINE),
        to_master: Pending::default(),
        to_client: Pending::default(),
        busy_client: false,
        busy_master: false,
        pinned_client: false,
        pinned_master: false,
      }),
    })
  }

  #[must_use]
  pub fn client_fd(&self) -> RawFd {
    self.client_fd
  }

  pub fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
    self.inner.lock()
  }
}

fn derive_interest(phase: Phase, outbound_clear: bool, inbound_pending: bool) -> Interest {
  match phase {
    Phase::New => Interest::INPUT,
    Phase::Established => Interest {
      input: outbound_clear,
      output: inbound_pending,
    },
    Phase::Terminated => Interest {
      input: false,
      output: false,
    },
  }
}

/// Maps live relay descriptors (client and master) to their records.
#[derive(Default)]
pub struct ConnTable {
  map: Mutex<HashMap<RawFd, Arc<Connection>>>,
}

impl ConnTable {
  pub fn insert(&self, fd: RawFd, conn: Arc<Connection>) {
    self.map.lock().insert(fd, conn);
  }

  #[must_use]
  pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
    self.map.lock().get(&fd).cloned()
  }

  pub fn remove(&self, fd: RawFd) {
    self.map.lock().remove(&fd);
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.map.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.map.lock().is_empty()
  }
}
