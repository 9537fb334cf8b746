use anyhow::Result;

use crate::ConnectArgs;
use crate::client;
use crate::config::ConnectConfig;

pub fn run(args: &ConnectArgs) -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
    .format_timestamp_secs()
    .try_init();

  client::run(&ConnectConfig::from_args(args))
}
