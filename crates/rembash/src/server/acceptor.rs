//! Accept-queue drain.
//!
//! Runs when the listening socket reports readiness: accepts until the
//! socket would block, sets each connection up (record, greeting, timer,
//! registration), then rearms the listener. A failure on one connection
//! drops that connection and moves on to the next.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{debug, error, warn};
use nix::errno::Errno;

use crate::protocol::GREETING;
use crate::server::conn::Connection;
use crate::server::poller::Interest;
use crate::server::Server;

pub fn drain(server: &Server) {
  loop {
    match server.listener.accept() {
      Ok((stream, addr)) => {
        if let Err(err) = admit_socket(server, stream, addr) {
          warn!("Dropping connection from {addr}: {err:#}");
        }
      }
      Err(err) if err.kind() == ErrorKind::WouldBlock => break,
      Err(err) => {
        // Resource exhaustion and the like: recoverable, retried on the
        // next readiness event.
        error!("Accept error: {err}");
        break;
      }
    }
  }
  if let Err(err) = server
    .poller
    .rearm(server.listener.as_raw_fd(), Interest::INPUT)
  {
    error!("Failed to rearm listener: {err:#}");
  }
}

fn admit_socket(server: &Server, stream: TcpStream, addr: SocketAddr) -> Result<()> {
  stream
    .set_nonblocking(true)
    .context("set client socket nonblocking")?;
  let client: OwnedFd = stream.into();
  let client_fd = client.as_raw_fd();
  let conn = Connection::new(client);

  write_greeting(client_fd)?;

  // The timer must exist before the descriptor can produce events, or a
  // fast handshake could finish first and a late arm would kill an
  // established session.
  server.timers.arm(&conn)?;
  server.conns.insert(client_fd, Arc::clone(&conn));
  if let Err(err) = server.poller.add(client_fd, Interest::INPUT) {
    server.teardown(&conn);
    return Err(err);
  }
  debug!("Accepted client {client_fd} from {addr}");
  Ok(())
}

/// A peer that cannot take the ten-byte greeting whole is not worth keeping.
fn write_greeting(client_fd: RawFd) -> Result<()> {
  let borrowed = unsafe { BorrowedFd::borrow_raw(client_fd) };
  match nix::unistd::write(borrowed, GREETING) {
    Ok(n) if n == GREETING.len() => Ok(()),
    Ok(n) => bail!("short greeting write ({n} of {} bytes)", GREETING.len()),
    Err(Errno::EAGAIN) => bail!("greeting write would block"),
    Err(err) => Err(err).context("write greeting"),
  }
}
