use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capacity of each inbox queue, in descriptors. A full inbox is a
/// fatal condition for the sender (see [`Reactor::send_msg`]), so this
/// is sized well above what one read burst can put in flight.
///
/// [`Reactor::send_msg`]: crate::Reactor::send_msg
pub const MSG_QUEUE_CAPACITY: usize = 1024;

/// State shared by every node: who is asleep, and how to poke them.
struct Shared {
  sleeping: Box<[AtomicBool]>,
  wakeup_fds: Box<[RawFd]>,
}

impl Drop for Shared {
  fn drop(&mut self) {
    for &fd in self.wakeup_fds.iter() {
      // SAFETY: These fds were created by build_mesh and are owned
      //         solely by this struct.
      unsafe { libc::close(fd) };
    }
  }
}

/// One core's view of the message mesh.
///
/// Holds the producer end of this core's outbox to every other core and
/// the consumer end of every inbox, so single-producer/single-consumer
/// use of each queue is enforced by ownership.
pub struct MeshNode<T> {
  thread_id: usize,
  producers: Vec<Option<spsc::Producer<T>>>,
  consumers: Vec<Option<spsc::Consumer<T>>>,
  shared: Arc<Shared>,
}

/// Create the full mesh for `nr_threads` cores: one node per core, with
/// every queue, sleep flag and wakeup eventfd already wired, so no
/// producer can ever observe a half-initialized peer.
pub fn build_mesh<T: Send>(nr_threads: usize) -> io::Result<Vec<MeshNode<T>>> {
  assert!(nr_threads > 0);

  let mut wakeup_fds = Vec::with_capacity(nr_threads);
  for _ in 0..nr_threads {
    let fd = sysresult!(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) });
    match fd {
      Ok(fd) => wakeup_fds.push(fd),
      Err(e) => {
        for fd in wakeup_fds {
          unsafe { libc::close(fd) };
        }
        return Err(e);
      }
    }
  }

  let shared = Arc::new(Shared {
    sleeping: (0..nr_threads).map(|_| AtomicBool::new(false)).collect(),
    wakeup_fds: wakeup_fds.into_boxed_slice(),
  });

  let mut nodes: Vec<MeshNode<T>> = (0..nr_threads)
    .map(|thread_id| MeshNode {
      thread_id,
      producers: (0..nr_threads).map(|_| None).collect(),
      consumers: (0..nr_threads).map(|_| None).collect(),
      shared: Arc::clone(&shared),
    })
    .collect();

  for dst in 0..nr_threads {
    for src in 0..nr_threads {
      if dst == src {
        continue;
      }
      let (tx, rx) = spsc::channel(MSG_QUEUE_CAPACITY);
      nodes[src].producers[dst] = Some(tx);
      nodes[dst].consumers[src] = Some(rx);
    }
  }

  Ok(nodes)
}

impl<T> MeshNode<T> {
  pub fn thread_id(&self) -> usize {
    self.thread_id
  }

  pub fn nr_threads(&self) -> usize {
    self.consumers.len()
  }

  /// The eventfd other cores write to wake this core from its poll.
  pub fn wakeup_fd(&self) -> RawFd {
    self.shared.wakeup_fds[self.thread_id]
  }

  /// Queue `msg` on the outbox to `remote_id`. Returns the message back
  /// if that inbox is full.
  ///
  /// # Panics
  /// Panics when `remote_id` is this core: a core does not message
  /// itself.
  pub fn try_send(&mut self, remote_id: usize, msg: T) -> Result<(), T> {
    let producer = self.producers[remote_id]
      .as_mut()
      .unwrap_or_else(|| panic!("core {} attempted to send a message to itself", remote_id));
    producer.try_emplace(msg)
  }

  /// Take one message from the inbox fed by `remote_id`.
  pub fn try_recv(&mut self, remote_id: usize) -> Option<T> {
    self.consumers[remote_id].as_mut()?.pop()
  }

  /// True if any inbox holds a message. This is the producer-race
  /// recheck of the sleep protocol, so it must be called *after* the
  /// sleep flag is published.
  pub fn has_inbound(&self) -> bool {
    self
      .consumers
      .iter()
      .flatten()
      .any(|consumer| !consumer.is_empty())
  }

  /// Publish whether this core is about to block in its poll. Full
  /// ordering: the flag store must not reorder with the queue recheck
  /// that follows it.
  pub fn set_sleeping(&self, sleeping: bool) {
    self.shared.sleeping[self.thread_id].store(sleeping, Ordering::SeqCst);
  }

  /// Wake `remote_id` if it is (or is about to go) asleep. Clearing the
  /// flag before writing the eventfd means a core is signaled at most
  /// once per nap.
  pub fn wake(&self, remote_id: usize) -> io::Result<()> {
    if self.shared.sleeping[remote_id].swap(false, Ordering::SeqCst) {
      let value = 1u64.to_ne_bytes();
      sysresult!(unsafe {
        libc::write(
          self.shared.wakeup_fds[remote_id],
          value.as_ptr() as *const libc::c_void,
          value.len(),
        )
      })?;
    }
    Ok(())
  }

  /// Drain this core's wakeup eventfd after the poll returned.
  pub fn clear_wakeup(&self) -> io::Result<()> {
    let mut value = [0u8; 8];
    let ret = unsafe {
      libc::read(
        self.wakeup_fd(),
        value.as_mut_ptr() as *mut libc::c_void,
        value.len(),
      )
    };
    if ret < 0 {
      let err = io::Error::last_os_error();
      // Raced with another drain or a spurious poll return; nothing to
      // clear is fine.
      if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(());
      }
      return Err(err);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_flow_between_nodes() {
    let mut nodes = build_mesh::<u32>(2).unwrap();
    let mut right = nodes.pop().unwrap();
    let mut left = nodes.pop().unwrap();

    assert!(left.try_send(1, 42).is_ok());
    assert!(right.has_inbound());
    assert_eq!(right.try_recv(0), Some(42));
    assert_eq!(right.try_recv(0), None);
    assert!(!right.has_inbound());
  }

  #[test]
  #[should_panic(expected = "send a message to itself")]
  fn send_to_self_is_a_bug() {
    let mut nodes = build_mesh::<u32>(2).unwrap();
    let _ = nodes[0].try_send(0, 1);
  }

  #[test]
  fn wake_writes_the_eventfd_once() {
    let nodes = build_mesh::<u32>(2).unwrap();

    nodes[1].set_sleeping(true);
    nodes[0].wake(1).unwrap();
    // The flag was consumed by the first wake; the second is a no-op.
    nodes[0].wake(1).unwrap();

    let mut value = [0u8; 8];
    let nr = unsafe {
      libc::read(
        nodes[1].wakeup_fd(),
        value.as_mut_ptr() as *mut libc::c_void,
        value.len(),
      )
    };
    assert_eq!(nr, 8);
    assert_eq!(u64::from_ne_bytes(value), 1);

    nodes[1].clear_wakeup().unwrap();
  }
}
