use anyhow::Result;

use crate::ServeArgs;
use crate::config::ServeConfig;
use crate::server::Server;

pub fn run(args: &ServeArgs) -> Result<()> {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .try_init();

  let config = ServeConfig::from_args(args);
  let server = Server::bind(config)?;
  server.run()
}
