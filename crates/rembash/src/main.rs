use std::process::ExitCode;

use owo_colors::OwoColorize as _;

fn main() -> ExitCode {
  match rembash::run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      // `:#` keeps the context chain on one line, which matters once the
      // terminal has been in raw mode.
      anstream::eprintln!("{} {}", "error:".red().bold(), format!("{err:#}").red());
      ExitCode::FAILURE
    }
  }
}
