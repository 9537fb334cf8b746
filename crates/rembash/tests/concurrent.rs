#![cfg(unix)]

use std::io::Write;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

mod helpers;
use helpers::*;

#[test]
#[serial]
fn a_hundred_clients_are_admitted_concurrently() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;
  let port = server.port;

  let mut clients = Vec::new();
  for _ in 0..100 {
    clients.push(thread::spawn(move || -> Result<()> {
      let stream = connect(port)?;
      let mut reader = handshake(&stream, TEST_SECRET)?;
      let mut writer = &stream;
      writer.write_all(b"exit\n")?;
      read_to_eof(&mut reader, Duration::from_secs(30))?;
      Ok(())
    }));
  }

  let mut failures = Vec::new();
  for (i, client) in clients.into_iter().enumerate() {
    match client.join() {
      Ok(Ok(())) => {}
      Ok(Err(err)) => failures.push(format!("client {i}: {err:#}")),
      Err(_) => failures.push(format!("client {i}: panicked")),
    }
  }
  assert!(failures.is_empty(), "failed clients: {failures:?}");
  Ok(())
}

#[test]
#[serial]
fn descriptors_return_to_baseline_after_sessions_end() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;

  // One warm-up cycle so lazily created descriptors are part of the
  // baseline.
  run_session(&server)?;
  thread::sleep(Duration::from_millis(500));
  let baseline = server.open_fd_count()?;

  for _ in 0..10 {
    run_session(&server)?;
  }

  // Teardown runs after the client observes the close; give it a moment.
  let deadline = std::time::Instant::now() + Duration::from_secs(5);
  let mut after = server.open_fd_count()?;
  while after != baseline && std::time::Instant::now() < deadline {
    thread::sleep(Duration::from_millis(100));
    after = server.open_fd_count()?;
  }
  assert_eq!(
    after, baseline,
    "descriptor count did not return to baseline"
  );
  Ok(())
}

fn run_session(server: &ServerProc) -> Result<()> {
  let stream = connect(server.port)?;
  let mut reader = handshake(&stream, TEST_SECRET)?;
  let mut writer = &stream;
  writer.write_all(b"exit\n")?;
  read_to_eof(&mut reader, Duration::from_secs(10))?;
  Ok(())
}
