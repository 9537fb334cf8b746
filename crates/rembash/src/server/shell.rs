//! PTY allocation and the shell child.
//!
//! The master side stays in the server: nonblocking, close-on-exec, and
//! registered with the main epoll like any other relay descriptor. The child
//! detaches into a new session and opens the slave path, which makes the PTY
//! its controlling terminal, then wires it to stdio and execs the shell.

use std::ffi::CString;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use log::debug;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::unistd::{ForkResult, fork, setsid};

/// Opens an unlocked PTY master and resolves the slave path into an owned
/// string. `ptsname_r` writes into a caller-owned buffer, so the path cannot
/// be clobbered by a later allocation on another thread.
pub fn open_shell_pty() -> Result<(OwnedFd, String)> {
  let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
    .context("open PTY master")?;
  grantpt(&master).context("grantpt")?;
  unlockpt(&master).context("unlock PTY slave")?;
  let slave_path = ptsname_r(&master).context("resolve PTY slave path")?;
  let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
  fcntl(&master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).context("set PTY master nonblocking")?;
  Ok((master, slave_path))
}

/// Forks the shell child for an admitted connection. The parent returns
/// immediately and never waits; SIGCHLD is ignored process-wide so children
/// are reaped by the kernel.
pub fn spawn_shell(shell: &str, slave_path: &str, client_fd: RawFd, master_fd: RawFd) -> Result<()> {
  let shell_c = CString::new(shell).context("shell program name")?;
  let slave_c = CString::new(slave_path).context("slave path")?;
  // argv assembled before fork so the child never allocates; the pointers
  // stay valid because the CStrings outlive both match arms.
  let argv: [*const libc::c_char; 2] = [shell_c.as_ptr(), std::ptr::null()];

  match unsafe { fork() }.context("fork shell child")? {
    ForkResult::Parent { child } => {
      debug!("Shell {shell} spawned as pid {child} on {slave_path}");
      Ok(())
    }
    ForkResult::Child => {
      // Between fork and exec only raw, allocation-free calls are safe.
      // Any failure exits the child; the parent notices via master HUP.
      if setsid().is_err() {
        unsafe { libc::_exit(101) };
      }
      unsafe {
        libc::close(client_fd);
        libc::close(master_fd);
        let slave = libc::open(slave_c.as_ptr(), libc::O_RDWR);
        if slave < 0 {
          libc::_exit(102);
        }
        if libc::dup2(slave, libc::STDIN_FILENO) < 0
          || libc::dup2(slave, libc::STDOUT_FILENO) < 0
          || libc::dup2(slave, libc::STDERR_FILENO) < 0
        {
          libc::_exit(103);
        }
        if slave > libc::STDERR_FILENO {
          libc::close(slave);
        }
        libc::execvp(shell_c.as_ptr(), argv.as_ptr());
        libc::_exit(104)
      }
    }
  }
}
