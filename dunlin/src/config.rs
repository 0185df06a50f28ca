use clap::Parser;

/// Command-line surface of the daemon.
///
/// All sizes are in mebibytes. The memory budget is split evenly across
/// worker threads, so it must divide by the thread count.
#[derive(Parser, Clone, Debug)]
#[command(name = "dunlin", version, about = "In-memory key/value cache daemon")]
pub struct Config {
  /// TCP port to listen on
  #[arg(short = 'p', long = "port", default_value_t = 11211)]
  pub tcp_port: u16,

  /// UDP port to listen on; 0 disables UDP and serves TCP instead
  #[arg(short = 'U', long = "udp-port", default_value_t = 0)]
  pub udp_port: u16,

  /// Interface address to listen on
  #[arg(short = 'l', long = "listen", default_value = "0.0.0.0")]
  pub listen_addr: String,

  /// Memory limit in MB
  #[arg(short = 'm', long = "memory-limit", default_value_t = 64)]
  pub memory_limit: usize,

  /// Segment size in MB
  #[arg(short = 's', long = "segment-size", default_value_t = 2)]
  pub segment_size: usize,

  /// Listen backlog size
  #[arg(short = 'b', long = "listen-backlog", default_value_t = 1024)]
  pub listen_backlog: i32,

  /// Number of worker threads
  #[arg(short = 't', long = "threads", default_value_t = 4)]
  pub nr_threads: usize,

  /// Comma-separated list of CPUs to keep worker threads off of
  #[arg(short = 'i', long = "isolate-cpus", value_delimiter = ',')]
  pub isolate_cpus: Vec<usize>,

  /// Run workers under the SCHED_FIFO real-time scheduling policy
  #[arg(short = 'S', long = "sched-fifo")]
  pub sched_fifo: bool,
}

impl Config {
  /// Check the cross-flag constraints that clap cannot express.
  pub fn validate(&self) -> Result<(), String> {
    if self.nr_threads == 0 {
      return Err("at least one worker thread is required".to_string());
    }
    if self.memory_limit % self.nr_threads != 0 {
      return Err(format!(
        "memory limit ({}) is not divisible by number of threads ({}), \
         which is required for partitioning",
        self.memory_limit, self.nr_threads
      ));
    }
    if self.segment_size == 0 {
      return Err("segment size must be non-zero".to_string());
    }
    if self.memory_limit / self.nr_threads < self.segment_size {
      return Err(format!(
        "per-thread memory ({} MB) must hold at least one segment ({} MB)",
        self.memory_limit / self.nr_threads,
        self.segment_size
      ));
    }
    Ok(())
  }

  /// Bytes of log memory each worker maps.
  pub fn per_thread_memory(&self) -> usize {
    self.memory_limit * 1024 * 1024 / self.nr_threads
  }

  /// Bytes per log segment.
  pub fn segment_bytes(&self) -> usize {
    self.segment_size * 1024 * 1024
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Config {
    Config::try_parse_from(std::iter::once("dunlin").chain(args.iter().copied())).unwrap()
  }

  #[test]
  fn defaults_match_the_wire_contract() {
    let config = parse(&[]);

    assert_eq!(config.tcp_port, 11211);
    assert_eq!(config.udp_port, 0);
    assert_eq!(config.listen_addr, "0.0.0.0");
    assert_eq!(config.memory_limit, 64);
    assert_eq!(config.segment_size, 2);
    assert_eq!(config.listen_backlog, 1024);
    assert_eq!(config.nr_threads, 4);
    assert!(config.isolate_cpus.is_empty());
    assert!(!config.sched_fifo);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn short_flags_parse() {
    let config = parse(&["-p", "11300", "-U", "11301", "-m", "128", "-t", "8", "-i", "0,2", "-S"]);

    assert_eq!(config.tcp_port, 11300);
    assert_eq!(config.udp_port, 11301);
    assert_eq!(config.memory_limit, 128);
    assert_eq!(config.nr_threads, 8);
    assert_eq!(config.isolate_cpus, [0, 2]);
    assert!(config.sched_fifo);
  }

  #[test]
  fn memory_must_divide_by_threads() {
    let config = parse(&["-m", "65", "-t", "4"]);
    let err = config.validate().unwrap_err();
    assert!(err.contains("not divisible"));
  }

  #[test]
  fn segment_must_fit_per_thread_memory() {
    let config = parse(&["-m", "4", "-t", "4", "-s", "2"]);
    assert!(config.validate().is_err());
  }

  #[test]
  fn unknown_flags_are_rejected() {
    assert!(Config::try_parse_from(["dunlin", "--bogus"]).is_err());
  }
}
