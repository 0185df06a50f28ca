use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::mesh::MeshNode;

bitflags! {
  /// Readiness interest for a registered file descriptor.
  #[derive(Clone, Copy, PartialEq, Eq, Debug)]
  pub struct Interest: u32 {
    const READ = libc::EPOLLIN as u32;
    const WRITE = libc::EPOLLOUT as u32;
  }
}

/// One readiness notification out of a poll.
#[derive(Clone, Copy, Debug)]
pub struct Event {
  pub fd: RawFd,
  pub readable: bool,
  pub writable: bool,
  pub error: bool,
}

const MAX_EVENTS: usize = 128;

/// A per-core readiness loop plus this core's mesh node.
///
/// The owning shard server drives the loop; the reactor provides the
/// pieces: fd registration with interest dedupe, the poll itself, the
/// cross-core send with its pending-wakeup set, and the sleep flag
/// handshake.
pub struct Reactor<T> {
  epollfd: RawFd,
  node: MeshNode<T>,
  interests: FxHashMap<RawFd, Interest>,
  pending_wakeups: Vec<bool>,
}

impl<T: Send> Reactor<T> {
  pub fn new(node: MeshNode<T>) -> io::Result<Self> {
    let epollfd = sysresult!(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

    let mut reactor = Self {
      pending_wakeups: vec![false; node.nr_threads()],
      epollfd,
      node,
      interests: FxHashMap::default(),
    };
    reactor.register(reactor.node.wakeup_fd(), Interest::READ)?;

    Ok(reactor)
  }

  pub fn thread_id(&self) -> usize {
    self.node.thread_id()
  }

  pub fn nr_threads(&self) -> usize {
    self.node.nr_threads()
  }

  /// Set the readiness interest for `fd`, adding it to the poll set on
  /// first registration. Re-registering with the current interest is a
  /// no-op.
  pub fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
    let op = match self.interests.get(&fd) {
      Some(current) if *current == interest => return Ok(()),
      Some(_) => libc::EPOLL_CTL_MOD,
      None => libc::EPOLL_CTL_ADD,
    };

    let mut event = libc::epoll_event {
      events: interest.bits(),
      u64: fd as u64,
    };
    sysresult!(unsafe { libc::epoll_ctl(self.epollfd, op, fd, &mut event) })?;
    self.interests.insert(fd, interest);

    Ok(())
  }

  /// Drop `fd` from the poll set.
  pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
    if self.interests.remove(&fd).is_some() {
      sysresult!(unsafe {
        libc::epoll_ctl(self.epollfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
      })?;
    }
    Ok(())
  }

  /// Queue `msg` for `remote_id` and note it for a wakeup. Returns the
  /// message back if the destination inbox is full.
  ///
  /// # Panics
  /// Panics when `remote_id` is this core.
  pub fn send_msg(&mut self, remote_id: usize, msg: T) -> Result<(), T> {
    self.node.try_send(remote_id, msg)?;
    self.pending_wakeups[remote_id] = true;
    Ok(())
  }

  /// Signal every core that was sent a message since the last flush and
  /// is asleep. Called at the top of every loop iteration.
  pub fn flush_wakeups(&mut self) -> io::Result<()> {
    for remote_id in 0..self.pending_wakeups.len() {
      if self.pending_wakeups[remote_id] {
        self.pending_wakeups[remote_id] = false;
        self.node.wake(remote_id)?;
      }
    }
    Ok(())
  }

  /// Take one message from any inbox, scanning sources in order. Per
  /// source, messages come out in the order they were sent.
  pub fn recv_msg(&mut self) -> Option<T> {
    for src in 0..self.node.nr_threads() {
      if let Some(msg) = self.node.try_recv(src) {
        return Some(msg);
      }
    }
    None
  }

  /// True if any inbox holds a message.
  pub fn has_messages(&self) -> bool {
    self.node.has_inbound()
  }

  /// Publish this core's sleep state. The store is sequentially
  /// consistent so the inbox recheck that follows `set_sleeping(true)`
  /// cannot be reordered before it; that double check closes the race
  /// with a producer enqueueing between the drain and the sleep
  /// decision.
  pub fn set_sleeping(&self, sleeping: bool) {
    self.node.set_sleeping(sleeping);
  }

  /// Wait for readiness. `timeout_ms` follows epoll conventions: 0
  /// polls, -1 blocks until an event or a wakeup signal arrives.
  ///
  /// Wakeup-eventfd notifications are consumed internally; everything
  /// else lands in `events`.
  pub fn poll(&mut self, events: &mut Vec<Event>, timeout_ms: i32) -> io::Result<()> {
    events.clear();

    let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
    let nr = unsafe { libc::epoll_wait(self.epollfd, buf.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) };
    if nr < 0 {
      let err = io::Error::last_os_error();
      if err.kind() == io::ErrorKind::Interrupted {
        return Ok(());
      }
      return Err(err);
    }

    for event in &buf[..nr as usize] {
      let fd = event.u64 as RawFd;
      if fd == self.node.wakeup_fd() {
        self.node.clear_wakeup()?;
        continue;
      }

      events.push(Event {
        fd,
        readable: event.events & (libc::EPOLLIN | libc::EPOLLHUP) as u32 != 0,
        writable: event.events & libc::EPOLLOUT as u32 != 0,
        error: event.events & libc::EPOLLERR as u32 != 0,
      });
    }

    trace!(
      "core {}: poll returned {} events",
      self.thread_id(),
      events.len()
    );

    Ok(())
  }
}

impl<T> Drop for Reactor<T> {
  fn drop(&mut self) {
    // SAFETY: epollfd was created by us and nothing else closes it.
    unsafe { libc::close(self.epollfd) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mesh::build_mesh;

  #[test]
  fn wakeup_signal_interrupts_an_infinite_poll() {
    let mut nodes = build_mesh::<u32>(2).unwrap();
    let peer = nodes.pop().unwrap();
    let mut reactor = Reactor::new(nodes.pop().unwrap()).unwrap();

    reactor.set_sleeping(true);
    peer.wake(0).unwrap();

    let mut events = Vec::new();
    // The eventfd write must bring the poll back; the notification
    // itself is consumed internally.
    reactor.poll(&mut events, -1).unwrap();
    reactor.set_sleeping(false);
    assert!(events.is_empty());
  }

  #[test]
  fn send_msg_sets_a_pending_wakeup() {
    let mut nodes = build_mesh::<u32>(2).unwrap();
    let mut peer = nodes.pop().unwrap();
    let mut reactor = Reactor::new(nodes.pop().unwrap()).unwrap();

    assert!(reactor.send_msg(1, 7).is_ok());
    peer.set_sleeping(true);
    reactor.flush_wakeups().unwrap();

    assert_eq!(peer.try_recv(0), Some(7));
    // The wake cleared the peer's sleep flag before signaling it.
    let mut events = Vec::new();
    let mut peer_reactor = Reactor::new(peer).unwrap();
    peer_reactor.poll(&mut events, 0).unwrap();
    assert!(events.is_empty());
  }

  #[test]
  fn recv_msg_drains_in_fifo_order() {
    let mut nodes = build_mesh::<u32>(2).unwrap();
    let right = nodes.pop().unwrap();
    let mut left = nodes.pop().unwrap();
    let mut right_reactor = Reactor::new(right).unwrap();

    for i in 0..4 {
      left.try_send(1, i).unwrap();
    }
    for i in 0..4 {
      assert_eq!(right_reactor.recv_msg(), Some(i));
    }
    assert_eq!(right_reactor.recv_msg(), None);
  }
}
