//! Thin wrapper around an epoll instance in edge-triggered one-shot mode.
//!
//! Every registration carries `EPOLLET | EPOLLONESHOT | EPOLLRDHUP`, so a
//! descriptor delivers at most one event and stays disarmed until rearmed.
//! Rearming goes through `EPOLL_CTL_MOD`, which re-checks readiness, so data
//! that arrived while the descriptor was disarmed still produces an event.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use anyhow::{Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Which readiness a descriptor is armed for. `input`/`output` both false
/// leaves the descriptor registered but disarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
  pub input: bool,
  pub output: bool,
}

impl Interest {
  pub const INPUT: Self = Self {
    input: true,
    output: false,
  };

  fn flags(self) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLET | EpollFlags::EPOLLONESHOT | EpollFlags::EPOLLRDHUP;
    if self.input {
      flags |= EpollFlags::EPOLLIN;
    }
    if self.output {
      flags |= EpollFlags::EPOLLOUT;
    }
    flags
  }
}

pub struct Poller {
  epoll: Epoll,
}

impl Poller {
  pub fn new() -> Result<Self> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("create epoll instance")?;
    Ok(Self { epoll })
  }

  /// Raw descriptor of the epoll instance itself, used to nest the timer
  /// instance inside the main one.
  #[must_use]
  pub fn as_raw_fd(&self) -> RawFd {
    self.epoll.0.as_raw_fd()
  }

  /// Registers `fd` and arms it with the given interest. The event payload
  /// is the descriptor number.
  pub fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    self
      .epoll
      .add(borrowed, EpollEvent::new(interest.flags(), fd as u64))
      .with_context(|| format!("register fd {fd} with epoll"))
  }

  /// Rearms a one-shot registration that has already fired (or changes the
  /// interest of an armed one).
  pub fn rearm(&self, fd: RawFd, interest: Interest) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut event = EpollEvent::new(interest.flags(), fd as u64);
    self
      .epoll
      .modify(borrowed, &mut event)
      .with_context(|| format!("rearm fd {fd}"))
  }

  /// Blocks until at least one registered descriptor is ready.
  pub fn wait(&self, events: &mut [EpollEvent]) -> Result<usize> {
    loop {
      match self.epoll.wait(events, EpollTimeout::NONE) {
        Ok(n) => return Ok(n),
        Err(nix::errno::Errno::EINTR) => continue,
        Err(err) => return Err(err).context("epoll_wait"),
      }
    }
  }

  /// Drains currently ready descriptors without blocking.
  pub fn poll(&self, events: &mut [EpollEvent]) -> Result<usize> {
    loop {
      match self.epoll.wait(events, EpollTimeout::ZERO) {
        Ok(n) => return Ok(n),
        Err(nix::errno::Errno::EINTR) => continue,
        Err(err) => return Err(err).context("epoll_wait"),
      }
    }
  }
}
