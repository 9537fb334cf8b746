use anyhow::Result;
use clap::{Args, Parser, Subcommand};

pub mod client;
pub mod commands;
pub mod config;
pub mod protocol;
pub mod server;

/// Rembash - interactive remote shells over TCP, gated by a shared secret.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Run the server: accept clients, verify the secret, bridge each one to
  /// a freshly spawned shell under a pseudo-terminal.
  Serve(ServeArgs),
  /// Connect to a server and attach the local terminal to the remote shell.
  Connect(ConnectArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
  /// TCP port to listen on (0 picks a free port; the bound address is logged).
  #[arg(long, default_value_t = config::DEFAULT_PORT)]
  pub port: u16,
  /// Shared secret clients must present during the handshake.
  /// Falls back to the REMBASH_SECRET environment variable.
  #[arg(long)]
  pub secret: Option<String>,
  /// Seconds a client may take to complete the handshake before it is dropped.
  #[arg(long, default_value_t = config::DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
  pub handshake_timeout: u64,
  /// Number of relay worker threads (defaults to the available parallelism).
  #[arg(long)]
  pub workers: Option<usize>,
  /// Shell program exec'd for each admitted client.
  #[arg(long, default_value = config::DEFAULT_SHELL)]
  pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConnectArgs {
  /// Server host name or address.
  pub host: String,
  /// Server TCP port.
  #[arg(long, default_value_t = config::DEFAULT_PORT)]
  pub port: u16,
  /// Shared secret to present during the handshake.
  /// Falls back to the REMBASH_SECRET environment variable.
  #[arg(long)]
  pub secret: Option<String>,
}

pub fn parse() -> Cli {
  Cli::parse()
}

pub fn run() -> Result<()> {
  let cli = parse();
  match cli.command {
    Command::Serve(args) => commands::serve::run(&args),
    Command::Connect(args) => commands::connect::run(&args),
  }
}
