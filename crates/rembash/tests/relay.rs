#![cfg(unix)]

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use serial_test::serial;

mod helpers;
use helpers::*;

#[test]
#[serial]
fn large_shell_output_arrives_in_order() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;

  let stream = connect(server.port)?;
  let mut reader = handshake(&stream, TEST_SECRET)?;

  let mut writer = &stream;
  // ~130 KiB of output; far beyond one relay buffer, so the master->client
  // direction must survive repeated backpressure without losing or
  // reordering bytes.
  writer.write_all(b"seq 1 20000; echo SEQ''DONE\n")?;
  let out = read_until(&mut reader, "SEQDONE", Duration::from_secs(30))?;

  let a = out.find("\r\n19998\r\n").expect("19998 missing");
  let b = out.find("\r\n19999\r\n").expect("19999 missing");
  let c = out.find("\r\n20000\r\n").expect("20000 missing");
  assert!(a < b && b < c, "tail of the sequence arrived out of order");

  writer.write_all(b"exit\n")?;
  read_to_eof(&mut reader, Duration::from_secs(10))?;
  Ok(())
}

#[test]
#[serial]
fn megabyte_paste_reaches_the_shell_intact() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;

  let stream = connect(server.port)?;
  let mut reader = handshake(&stream, TEST_SECRET)?;

  let mut writer = &stream;
  // Echo off so the counted bytes are not mirrored back on top of the
  // count; canonical mode caps line length, hence many short lines.
  writer.write_all(b"stty -echo; cat | wc -c; stty echo\n")?;
  std::thread::sleep(Duration::from_millis(300));

  let mut line = b"x".repeat(1023);
  line.push(b'\n');
  let mut sent = 0usize;
  for _ in 0..1024 {
    writer.write_all(&line)?;
    sent += line.len();
  }
  // EOF for `cat` at the terminal.
  writer.write_all(&[0x04])?;

  let expected = sent.to_string();
  let out = read_until(&mut reader, &expected, Duration::from_secs(60))?;
  assert!(out.contains(&expected));

  writer.write_all(b"exit\n")?;
  read_to_eof(&mut reader, Duration::from_secs(10))?;
  Ok(())
}

#[test]
#[serial]
fn shell_exit_closes_the_connection() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;

  let stream = connect(server.port)?;
  let mut reader = handshake(&stream, TEST_SECRET)?;

  let mut writer = &stream;
  writer.write_all(b"exit\n")?;
  read_to_eof(&mut reader, Duration::from_secs(10))?;
  Ok(())
}

#[test]
#[serial]
fn both_directions_flow_concurrently() -> Result<()> {
  let server = ServerProc::spawn(TEST_SECRET, 5)?;

  let stream = connect(server.port)?;
  let mut reader = handshake(&stream, TEST_SECRET)?;

  let mut writer = &stream;
  // A long-running producer in the background keeps the master->client
  // direction busy while fresh input still has to reach the shell.
  writer.write_all(b"(for i in $(seq 1 200); do echo tick $i; sleep 0.01; done) &\n")?;
  std::thread::sleep(Duration::from_millis(200));
  writer.write_all(b"echo PI''NG\n")?;

  let out = read_until(&mut reader, "PING", Duration::from_secs(15))?;
  assert!(out.contains("tick"));

  writer.write_all(b"wait; exit\n")?;
  read_to_eof(&mut reader, Duration::from_secs(15))?;
  Ok(())
}
