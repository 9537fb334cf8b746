//! Bidirectional relay between the client socket and the PTY master.
//!
//! Each invocation handles one readiness event for one descriptor. The two
//! directions are independent: a stalled client->master direction does not
//! stop master->client traffic. Unwritten suffixes are copied into the
//! connection record before the dispatch returns; nothing ever points into a
//! worker's stack buffer. Writes that cross the bridge pin the target
//! descriptor so a teardown racing the write cannot close it mid-syscall.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::config::RELAY_BUFFER_SIZE;
use crate::server::Server;
use crate::server::conn::{Connection, Phase};

/// Services one readiness event: first drains any backlog whose write
/// target is this descriptor, then pumps fresh bytes from it toward its
/// peer. Both halves are speculative; a half whose readiness did not fire
/// simply hits `EAGAIN` or an empty backlog and is a no-op.
pub fn service(server: &Server, conn: &Arc<Connection>, fd: RawFd) {
  if !drain_backlog(server, conn, fd) {
    return;
  }
  pump(server, conn, fd);
}

/// Writes buffered bytes whose target is `fd`. Returns false when the
/// connection was torn down. On completion the stalled source descriptor is
/// armed for input again. The write target here is the dispatched
/// descriptor itself, so the worker's busy mark already keeps it open.
fn drain_backlog(server: &Server, conn: &Arc<Connection>, fd: RawFd) -> bool {
  let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
  let mut inner = conn.lock();
  if inner.phase != Phase::Established {
    return false;
  }
  if inner.pending_toward(fd).is_empty() {
    return true;
  }
  loop {
    match write(borrowed, inner.pending_toward(fd).remaining()) {
      Ok(0) => {
        drop(inner);
        warn!("Write target {fd} accepted no bytes; terminating");
        server.teardown(conn);
        return false;
      }
      Ok(n) => {
        inner.pending_toward(fd).advance(n);
        if inner.pending_toward(fd).is_empty() {
          break;
        }
      }
      // Still backpressured; the finishing rearm keeps output armed.
      Err(Errno::EAGAIN) => return true,
      Err(Errno::EINTR) => continue,
      Err(err) => {
        drop(inner);
        debug!("Drain toward {fd} failed ({err}); terminating");
        server.teardown(conn);
        return false;
      }
    }
  }
  // Backlog cleared: the direction's source may read again.
  let source = inner.peer_of(fd);
  drop(inner);
  if let Some(source) = source {
    server.arm_if_idle(conn, source);
  }
  true
}

/// Reads one chunk from `fd` and forwards it to the peer, buffering the
/// unwritten suffix on backpressure and arming the write target for output.
fn pump(server: &Server, conn: &Arc<Connection>, fd: RawFd) -> bool {
  let (peer, clear) = {
    let mut inner = conn.lock();
    if inner.phase != Phase::Established {
      return false;
    }
    let Some(peer) = inner.peer_of(fd) else {
      return false;
    };
    (peer, inner.pending_toward(peer).is_empty())
  };
  if !clear {
    // This direction is stalled; reading now would reorder bytes ahead of
    // the backlog. The drain path rearms the source when it finishes.
    return true;
  }

  let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
  let mut buf = [0u8; RELAY_BUFFER_SIZE];
  let n = loop {
    match read(borrowed, &mut buf) {
      Ok(0) => {
        debug!("Descriptor {fd} reached end of stream; terminating");
        server.teardown(conn);
        return false;
      }
      Ok(n) => break n,
      Err(Errno::EAGAIN) => return true,
      Err(Errno::EINTR) => continue,
      Err(err) => {
        debug!("Read from {fd} failed ({err}); terminating");
        server.teardown(conn);
        return false;
      }
    }
  };

  // The peer's own readiness may be serviced concurrently and a teardown
  // can arrive from either side; the pin keeps the peer descriptor open
  // until our write has returned.
  if !server.pin(conn, peer) {
    return false;
  }
  let outcome = forward(server, conn, peer, &buf[..n]);
  server.unpin(conn, peer);
  outcome
}

/// Writes one chunk to the pinned peer, buffering the unwritten suffix on
/// backpressure and arming the write target for output.
fn forward(server: &Server, conn: &Arc<Connection>, peer: RawFd, bytes: &[u8]) -> bool {
  let peer_borrowed = unsafe { BorrowedFd::borrow_raw(peer) };
  let mut written = 0;
  while written < bytes.len() {
    match write(peer_borrowed, &bytes[written..]) {
      Ok(0) => {
        warn!("Peer {peer} accepted no bytes; terminating");
        server.teardown(conn);
        return false;
      }
      Ok(m) => written += m,
      Err(Errno::EAGAIN) => {
        {
          let mut inner = conn.lock();
          if inner.phase != Phase::Established {
            return false;
          }
          inner.pending_toward(peer).load(&bytes[written..]);
        }
        server.arm_if_idle(conn, peer);
        return true;
      }
      Err(Errno::EINTR) => continue,
      Err(err) => {
        debug!("Write to {peer} failed ({err}); terminating");
        server.teardown(conn);
        return false;
      }
    }
  }
  true
}
