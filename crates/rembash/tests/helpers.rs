#![cfg(unix)]
#![allow(dead_code)]

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};

pub const TEST_SECRET: &str = "testsecret";

#[must_use]
pub fn bin() -> PathBuf {
  assert_cmd::cargo::cargo_bin!("rembash").to_path_buf()
}

/// Picks a port that was free a moment ago. Good enough for tests that
/// start the server right away.
pub fn free_port() -> u16 {
  let probe = TcpListener::bind(("127.0.0.1", 0)).expect("bind port probe");
  probe.local_addr().expect("probe local addr").port()
}

/// A `rembash serve` child killed on drop.
pub struct ServerProc {
  child: Child,
  pub port: u16,
}

impl ServerProc {
  pub fn spawn(secret: &str, handshake_timeout_secs: u64) -> Result<Self> {
    let port = free_port();
    let child = Command::new(bin())
      .args([
        "serve",
        "--port",
        &port.to_string(),
        "--secret",
        secret,
        "--handshake-timeout",
        &handshake_timeout_secs.to_string(),
      ])
      .env("RUST_LOG", "debug")
      .stdout(Stdio::null())
      .spawn()
      .context("spawn rembash serve")?;
    let server = Self { child, port };
    server.wait_until_ready(Duration::from_secs(10))?;
    Ok(server)
  }

  pub fn pid(&self) -> u32 {
    self.child.id()
  }

  /// Connects until the listener answers with the greeting.
  fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if let Ok(stream) = TcpStream::connect(("127.0.0.1", self.port)) {
        stream.set_read_timeout(Some(Duration::from_secs(2)))?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).is_ok() && line == "<rembash>\n" {
          return Ok(());
        }
      }
      std::thread::sleep(Duration::from_millis(50));
    }
    bail!("server did not become ready on port {}", self.port)
  }

  /// Number of descriptors the server process currently holds open.
  pub fn open_fd_count(&self) -> Result<usize> {
    let entries = std::fs::read_dir(format!("/proc/{}/fd", self.pid()))
      .context("read /proc/<pid>/fd")?
      .count();
    Ok(entries)
  }
}

impl Drop for ServerProc {
  fn drop(&mut self) {
    let _ = self.child.kill();
    let _ = self.child.wait();
  }
}

pub fn connect(port: u16) -> Result<TcpStream> {
  let stream =
    TcpStream::connect(("127.0.0.1", port)).with_context(|| format!("connect to port {port}"))?;
  stream.set_read_timeout(Some(Duration::from_secs(10)))?;
  Ok(stream)
}

pub fn expect_line(reader: &mut impl BufRead, want: &str) -> Result<()> {
  let mut line = String::new();
  reader.read_line(&mut line).context("read protocol line")?;
  ensure!(line == want, "expected {want:?}, got {line:?}");
  Ok(())
}

/// Runs the client half of the handshake and hands back the reader so no
/// buffered shell output is lost.
pub fn handshake(stream: &TcpStream, secret: &str) -> Result<BufReader<TcpStream>> {
  let mut reader = BufReader::new(stream.try_clone().context("clone stream")?);
  expect_line(&mut reader, "<rembash>\n")?;
  let mut writer = stream;
  writer
    .write_all(format!("<{secret}>\n").as_bytes())
    .context("send secret")?;
  expect_line(&mut reader, "<ok>\n")?;
  Ok(reader)
}

/// Reads until `needle` shows up in the accumulated output or the deadline
/// passes. Returns everything read so far.
pub fn read_until(
  reader: &mut BufReader<TcpStream>,
  needle: &str,
  timeout: Duration,
) -> Result<String> {
  let deadline = Instant::now() + timeout;
  let mut seen = String::new();
  let mut buf = [0u8; 4096];
  loop {
    if seen.contains(needle) {
      return Ok(seen);
    }
    if Instant::now() >= deadline {
      bail!("timed out waiting for {needle:?}; saw {} bytes", seen.len());
    }
    match reader.read(&mut buf) {
      Ok(0) => bail!("connection closed while waiting for {needle:?}"),
      Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
      Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
      Err(err) if err.kind() == ErrorKind::Interrupted => {}
      Err(err) => return Err(err).context("read shell output"),
    }
  }
}

/// Waits for the server to close the connection; tolerates buffered output
/// arriving first.
pub fn read_to_eof(reader: &mut BufReader<TcpStream>, timeout: Duration) -> Result<()> {
  let deadline = Instant::now() + timeout;
  let mut buf = [0u8; 4096];
  loop {
    if Instant::now() >= deadline {
      bail!("connection was not closed in time");
    }
    match reader.read(&mut buf) {
      Ok(0) => return Ok(()),
      Ok(_) => {}
      Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
      Err(err) if err.kind() == ErrorKind::Interrupted => {}
      // A reset also counts as closed from the client's point of view.
      Err(_) => return Ok(()),
    }
  }
}
