//! Client side: handshake mirror and terminal bridge.
//!
//! Connects, validates the greeting, presents the secret, and on `<ok>`
//! turns into a dumb pipe: one thread forwards stdin to the socket while the
//! main thread forwards socket bytes to stdout. The local terminal is in raw
//! mode for the duration of the bridge and is restored on every exit path by
//! the guard's drop.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;

use anyhow::{Context, Result, bail};
use crossterm::tty::IsTty;
use log::debug;

use crate::config::ConnectConfig;
use crate::protocol::{ERROR, GREETING, OK, secret_line};

mod tty;
use tty::RawModeGuard;

pub fn run(config: &ConnectConfig) -> Result<()> {
  let stream = TcpStream::connect((config.host.as_str(), config.port))
    .with_context(|| format!("connect to {}:{}", config.host, config.port))?;
  let mut reader = BufReader::new(stream.try_clone().context("clone socket")?);
  handshake(&mut reader, &stream, &config.secret)?;
  debug!("Handshake complete; bridging terminal");
  bridge(reader, stream)
}

/// The client half of the admission protocol. Line-buffered reads are safe
/// here and stay safe afterwards because the same reader carries on into
/// the bridge, so no buffered shell output is lost.
fn handshake(reader: &mut BufReader<TcpStream>, mut writer: &TcpStream, secret: &str) -> Result<()> {
  let mut line = String::new();
  reader.read_line(&mut line).context("read greeting")?;
  if line.as_bytes() != GREETING {
    bail!("unexpected greeting from server: {line:?}");
  }

  writer
    .write_all(&secret_line(secret))
    .context("send secret")?;

  line.clear();
  reader.read_line(&mut line).context("read handshake reply")?;
  if line.as_bytes() == OK {
    Ok(())
  } else if line.as_bytes() == ERROR {
    bail!("server rejected the secret")
  } else {
    bail!("unexpected handshake reply: {line:?}")
  }
}

fn bridge(mut reader: BufReader<TcpStream>, stream: TcpStream) -> Result<()> {
  // Raw mode only when stdin is a real terminal; a piped stdin (tests,
  // scripting) has no mode to save.
  let raw = if std::io::stdin().is_tty() {
    Some(RawModeGuard::enable()?)
  } else {
    None
  };

  let socket_writer = stream.try_clone().context("clone socket")?;
  let input = thread::Builder::new()
    .name("stdin-forwarder".to_string())
    .spawn(move || {
      let mut writer = socket_writer;
      let mut stdin = std::io::stdin().lock();
      let mut buf = [0u8; 8192];
      loop {
        match stdin.read(&mut buf) {
          Ok(0) => break,
          Ok(n) => {
            if writer.write_all(&buf[..n]).is_err() {
              break;
            }
          }
          Err(err) if err.kind() == ErrorKind::Interrupted => {}
          Err(_) => break,
        }
      }
    })
    .context("spawn stdin forwarder")?;

  let mut stdout = std::io::stdout().lock();
  let mut buf = [0u8; 8192];
  loop {
    match reader.read(&mut buf) {
      // Server closed the session (shell exit or teardown).
      Ok(0) => break,
      Ok(n) => {
        stdout.write_all(&buf[..n]).context("write to stdout")?;
        stdout.flush().context("flush stdout")?;
      }
      Err(err) if err.kind() == ErrorKind::Interrupted => {}
      Err(_) => break,
    }
  }

  drop(raw);
  let _ = stream.shutdown(Shutdown::Both);
  // The forwarder may be parked in a blocking stdin read; process exit
  // collects it.
  drop(input);
  Ok(())
}
