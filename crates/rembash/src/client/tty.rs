//! Terminal mode handling for the bridge.

use anyhow::Result;
use crossterm::terminal;

/// Puts the local terminal into raw mode (non-canonical, no echo) for the
/// lifetime of this guard and restores it when dropped. Raw mode is what
/// lets single keystrokes and control bytes reach the remote shell instead
/// of being cooked locally.
pub struct RawModeGuard;

impl RawModeGuard {
  pub fn enable() -> Result<Self> {
    terminal::enable_raw_mode()?;
    Ok(Self)
  }
}

impl Drop for RawModeGuard {
  fn drop(&mut self) {
    let _ = terminal::disable_raw_mode();
  }
}
