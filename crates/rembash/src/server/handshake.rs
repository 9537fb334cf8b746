//! Admission control.
//!
//! Runs on client readiness while the connection is `NEW`. The secret line
//! is read byte-wise so nothing past the newline is consumed, and the
//! partial line survives across readiness events in the connection record.
//! A match cancels the expiration timer, acknowledges with `<ok>`, and
//! commissions the PTY and shell; anything else gets a best-effort
//! `<error>` and teardown.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use nix::errno::Errno;
use nix::unistd::{read, write};

use crate::protocol::{ERROR, LineStatus, OK, secret_line};
use crate::server::Server;
use crate::server::conn::{Connection, Phase};
use crate::server::poller::Interest;
use crate::server::shell;

pub fn admit(server: &Server, conn: &Arc<Connection>) {
  let client_fd = conn.client_fd();
  let borrowed = unsafe { BorrowedFd::borrow_raw(client_fd) };
  let mut byte = [0u8; 1];
  loop {
    match read(borrowed, &mut byte) {
      Ok(0) => {
        info!("Client {client_fd} closed before completing the handshake");
        server.teardown(conn);
        return;
      }
      Ok(_) => {
        // Bind before matching: the guard must not outlive this statement,
        // commission and reject take the same lock.
        let status = conn.lock().greeting.push(&byte);
        match status {
          LineStatus::Partial => continue,
          LineStatus::Overflow => {
            reject(server, conn, "overlong handshake line");
            return;
          }
          LineStatus::Complete(line) => {
            if line == secret_line(&server.config.secret) {
              if let Err(err) = commission(server, conn) {
                warn!("Failed to commission shell for client {client_fd}: {err:#}");
                server.teardown(conn);
              }
            } else {
              reject(server, conn, "secret mismatch");
            }
            return;
          }
        }
      }
      // Line still incomplete; stay NEW and let the finishing rearm keep
      // the descriptor armed for input.
      Err(Errno::EAGAIN) => return,
      Err(Errno::EINTR) => continue,
      Err(err) => {
        warn!("Handshake read failed for client {client_fd}: {err}");
        server.teardown(conn);
        return;
      }
    }
  }
}

/// Best-effort `<error>`, then teardown. The write is allowed to fail; the
/// peer may already be gone.
fn reject(server: &Server, conn: &Arc<Connection>, reason: &str) {
  let client_fd = conn.client_fd();
  info!("Rejecting client {client_fd}: {reason}");
  let borrowed = unsafe { BorrowedFd::borrow_raw(client_fd) };
  let _ = write(borrowed, ERROR);
  server.teardown(conn);
}

/// Admission succeeded: cancel the timer, acknowledge, allocate the PTY,
/// register the master, and launch the shell. Runs on the worker that owns
/// the client descriptor's one-shot event.
fn commission(server: &Server, conn: &Arc<Connection>) -> Result<()> {
  let client_fd = conn.client_fd();
  server.timers.cancel(conn);

  let borrowed = unsafe { BorrowedFd::borrow_raw(client_fd) };
  match write(borrowed, OK) {
    Ok(n) if n == OK.len() => {}
    Ok(n) => bail!("short write of acknowledgement ({n} of {} bytes)", OK.len()),
    Err(err) => return Err(err).context("write acknowledgement"),
  }

  let (master, slave_path) = shell::open_shell_pty()?;
  let master_fd = master.as_raw_fd();
  {
    // Install, index, and register under one lock scope so a concurrent
    // teardown (timer expiry, hang-up) cannot interleave and leave a
    // registered master behind on a dead record.
    let mut inner = conn.lock();
    if inner.phase != Phase::New {
      bail!("connection torn down during admission");
    }
    inner.install_master(master);
    inner.phase = Phase::Established;
    server.conns.insert(master_fd, Arc::clone(conn));
    server
      .poller
      .add(master_fd, Interest::INPUT)
      .context("register PTY master")?;
  }
  shell::spawn_shell(&server.config.shell, &slave_path, client_fd, master_fd)?;
  info!("Client {client_fd} admitted; shell on {slave_path}");
  Ok(())
}
