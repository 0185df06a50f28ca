#[macro_use]
extern crate log;

use clap::Parser;

use dunlin::{serve, Config};

fn main() {
  if std::env::var_os("DUNLIN_LOG").is_none() {
    std::env::set_var("DUNLIN_LOG", "info");
  }
  env_logger::init_from_env("DUNLIN_LOG");

  let config = Config::parse();
  if let Err(err) = config.validate() {
    eprintln!("error: {}", err);
    std::process::exit(1);
  }

  info!(
    "starting {} worker threads, {} MB memory, {} MB segments",
    config.nr_threads, config.memory_limit, config.segment_size
  );

  if let Err(err) = serve(&config) {
    eprintln!("error: {}", err);
    std::process::exit(1);
  }
}
