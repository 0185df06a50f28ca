use std::io;
use std::sync::mpsc;

use reactor::{build_mesh, MeshNode};

use crate::command::Command;
use crate::config::Config;
use crate::server::Worker;

/// Hands out CPU ids for worker pinning, skipping the isolated list.
struct CpuPicker {
  isolated: Vec<usize>,
  next: usize,
}

impl CpuPicker {
  fn new(isolated: &[usize]) -> Self {
    Self {
      isolated: isolated.to_vec(),
      next: 0,
    }
  }

  fn next_cpu(&mut self) -> usize {
    let mut id = self.next;
    while self.isolated.contains(&id) {
      id += 1;
    }
    self.next = id + 1;
    id
  }
}

fn pin_to_cpu(thread_id: usize, cpu_id: usize) {
  let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: cpu_id });
  if !pinned {
    warn!("worker {}: could not pin to cpu {}", thread_id, cpu_id);
  }
}

fn apply_sched_fifo() -> io::Result<()> {
  // Minimum realtime priority, matching a fixed FIFO priority of 1.
  thread_priority::set_thread_priority_and_policy(
    thread_priority::thread_native_id(),
    thread_priority::ThreadPriority::Min,
    thread_priority::ThreadSchedulePolicy::Realtime(
      thread_priority::RealtimeThreadSchedulePolicy::Fifo,
    ),
  )
  .map_err(|err| {
    io::Error::new(
      io::ErrorKind::PermissionDenied,
      format!("setting SCHED_FIFO failed: {:?}", err),
    )
  })
}

fn setup_worker(
  cpu_id: usize,
  config: &Config,
  node: MeshNode<Box<Command>>,
) -> io::Result<Worker> {
  let thread_id = node.thread_id();

  pin_to_cpu(thread_id, cpu_id);
  if config.sched_fifo {
    apply_sched_fifo()?;
  }

  let worker = Worker::new(config, node)?;
  info!(
    "worker {}: listening on {}:{} ({})",
    thread_id,
    config.listen_addr,
    worker.local_port()?,
    match config.udp_port {
      0 => "tcp",
      _ => "udp",
    }
  );
  Ok(worker)
}

/// Run the worker pool on the calling thread until process termination.
///
/// Startup failure in any worker takes the whole process down with a
/// diagnostic; the cache holds no state worth limping along for.
pub fn serve(config: &Config) -> io::Result<()> {
  let nodes = build_mesh(config.nr_threads)?;
  let mut cpus = CpuPicker::new(&config.isolate_cpus);

  let pool = crossbeam::scope(|scope| {
    for node in nodes {
      let cpu_id = cpus.next_cpu();
      scope.spawn(move |_| {
        let thread_id = node.thread_id();
        let result = setup_worker(cpu_id, config, node).and_then(|mut worker| worker.run());
        if let Err(err) = result {
          error!("worker {}: {}", thread_id, err);
          std::process::exit(1);
        }
      });
    }
  });

  pool.map_err(|_| io::Error::new(io::ErrorKind::Other, "a worker thread panicked"))
}

/// Spawn the worker pool in the background and report the workers'
/// bound ports, one per worker in startup-completion order. This is the
/// embedding entry point; the integration tests drive a live server
/// through it.
pub fn spawn(config: Config) -> io::Result<Vec<u16>> {
  config
    .validate()
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

  let nodes = build_mesh(config.nr_threads)?;
  let mut cpus = CpuPicker::new(&config.isolate_cpus);
  let (port_tx, port_rx) = mpsc::channel();

  for node in nodes {
    let cpu_id = cpus.next_cpu();
    let config = config.clone();
    let port_tx = port_tx.clone();

    std::thread::spawn(move || {
      let thread_id = node.thread_id();
      let mut worker = match setup_worker(cpu_id, &config, node) {
        Ok(worker) => worker,
        Err(err) => {
          let _ = port_tx.send(Err(err));
          return;
        }
      };
      let _ = port_tx.send(worker.local_port());
      // The worker runs for the process lifetime; release the channel
      // so the caller's receive loop can finish.
      drop(port_tx);

      if let Err(err) = worker.run() {
        error!("worker {}: {}", thread_id, err);
      }
    });
  }
  drop(port_tx);

  port_rx.iter().collect()
}
