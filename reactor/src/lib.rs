//! Per-core event loop plumbing.
//!
//! Each worker thread owns one [`Reactor`]: an epoll instance, a table
//! of registered file descriptors, and this core's node of the
//! cross-core message mesh. The mesh is an N×N grid of wait-free SPSC
//! queues plus one sleep flag and one wakeup eventfd per core; a core
//! that finds nothing to do parks itself in `epoll_wait` and is poked
//! through its eventfd by the first producer that queues a message for
//! it.
//!
//! Nothing in here dispatches events. The owner of the reactor drives
//! the loop itself: flush pending wakeups, drain the inboxes, decide
//! whether to sleep, poll, then handle what the poll returned.

#[macro_use]
extern crate log;

macro_rules! sysresult {
  ($ret:expr) => {{
    match $ret {
      ret if ret < 0 => Err(std::io::Error::last_os_error()),
      ret => Ok(ret),
    }
  }};
}

mod mesh;
mod reactor;
mod socket;

pub use crate::mesh::{build_mesh, MeshNode, MSG_QUEUE_CAPACITY};
pub use crate::reactor::{Event, Interest, Reactor};
pub use crate::socket::{
  make_tcp_listener, make_udp_socket, RecvStatus, SendStatus, SockAddr, TcpListener, TcpSocket,
  UdpSocket,
};
