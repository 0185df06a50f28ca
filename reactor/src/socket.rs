use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

/// A raw socket address as the kernel hands it out, so UDP replies can
/// echo it back without any re-encoding.
#[derive(Clone, Copy)]
pub struct SockAddr {
  storage: libc::sockaddr_storage,
  len: libc::socklen_t,
}

impl SockAddr {
  fn new(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Self {
    Self { storage, len }
  }

  fn as_ptr(&self) -> *const libc::sockaddr {
    &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
  }

  fn len(&self) -> libc::socklen_t {
    self.len
  }
}

/// Result of a non-blocking send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
  /// Everything was handed to the kernel.
  Done,
  /// Some bytes are parked in the tx buffer; the caller should ask for
  /// write readiness and retry via [`TcpSocket::flush`].
  Blocked,
  /// The peer is gone; the caller should close the socket.
  Closed,
}

/// Result of a non-blocking read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvStatus {
  /// This many bytes were read.
  Data(usize),
  /// Zero-length read or connection reset: the peer closed.
  Closed,
  /// Nothing available right now; wait for the next readiness event.
  Retry,
}

fn parse_iface(iface: &str) -> io::Result<Ipv4Addr> {
  iface.parse().map_err(|_| {
    io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("'{}': not a valid listen address", iface),
    )
  })
}

fn sockaddr_of(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
  libc::sockaddr_in {
    sin_family: libc::AF_INET as libc::sa_family_t,
    sin_port: port.to_be(),
    sin_addr: libc::in_addr {
      s_addr: u32::from_ne_bytes(addr.octets()),
    },
    sin_zero: [0; 8],
  }
}

fn set_reuse(fd: RawFd) -> io::Result<()> {
  let one: libc::c_int = 1;
  sysresult!(unsafe {
    libc::setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &one as *const _ as *const libc::c_void,
      mem::size_of_val(&one) as libc::socklen_t,
    )
  })?;
  sysresult!(unsafe {
    libc::setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEPORT,
      &one as *const _ as *const libc::c_void,
      mem::size_of_val(&one) as libc::socklen_t,
    )
  })?;
  Ok(())
}

fn bind_to(fd: RawFd, addr: Ipv4Addr, port: u16) -> io::Result<()> {
  let sockaddr = sockaddr_of(addr, port);
  sysresult!(unsafe {
    libc::bind(
      fd,
      &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
      mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    )
  })?;
  Ok(())
}

fn bound_port(fd: RawFd) -> io::Result<u16> {
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  sysresult!(unsafe {
    libc::getsockname(
      fd,
      &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
      &mut len,
    )
  })?;

  // SAFETY: The socket is AF_INET, so the kernel filled in a sockaddr_in.
  let sockaddr = unsafe { &*(&storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
  Ok(u16::from_be(sockaddr.sin_port))
}

/// A non-blocking TCP listening socket. Every worker binds its own on
/// the same port; the kernel's reuseport balancing makes connections
/// sticky to one core.
pub struct TcpListener {
  fd: RawFd,
}

pub fn make_tcp_listener(iface: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
  let addr = parse_iface(iface)?;

  let fd = sysresult!(unsafe {
    libc::socket(
      libc::AF_INET,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
    )
  })?;
  let listener = TcpListener { fd };

  set_reuse(fd)?;
  bind_to(fd, addr, port)?;
  sysresult!(unsafe { libc::listen(fd, backlog) })?;

  Ok(listener)
}

impl TcpListener {
  pub fn fd(&self) -> RawFd {
    self.fd
  }

  /// The port this listener is bound to; useful when binding port 0.
  pub fn local_port(&self) -> io::Result<u16> {
    bound_port(self.fd)
  }

  /// Accept one pending connection, or `None` if there is none.
  pub fn accept(&self) -> io::Result<Option<RawFd>> {
    let fd = unsafe {
      libc::accept4(
        self.fd,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      )
    };
    if fd < 0 {
      let err = io::Error::last_os_error();
      return match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
        _ => Err(err),
      };
    }
    Ok(Some(fd))
  }
}

impl Drop for TcpListener {
  fn drop(&mut self) {
    unsafe { libc::close(self.fd) };
  }
}

/// A connected non-blocking TCP socket with a tx residual buffer.
///
/// The socket is shared between the owning core's connection table and
/// any in-flight cross-core descriptor that refers to it. Only the
/// owning core ever performs I/O or touches the tx buffer; remote cores
/// treat the handle as opaque, which is what makes the unsafe `Send` and
/// `Sync` impls below sound.
pub struct TcpSocket {
  fd: RawFd,
  tx: RefCell<Vec<u8>>,
}

unsafe impl Send for TcpSocket {}
unsafe impl Sync for TcpSocket {}

impl TcpSocket {
  pub fn new(fd: RawFd) -> Self {
    Self {
      fd,
      tx: RefCell::new(Vec::new()),
    }
  }

  pub fn fd(&self) -> RawFd {
    self.fd
  }

  pub fn set_nodelay(&self) -> io::Result<()> {
    let one: libc::c_int = 1;
    sysresult!(unsafe {
      libc::setsockopt(
        self.fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        &one as *const _ as *const libc::c_void,
        mem::size_of_val(&one) as libc::socklen_t,
      )
    })?;
    Ok(())
  }

  /// Read into `buf`. A zero-length read and a connection reset both
  /// report [`RecvStatus::Closed`].
  pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvStatus> {
    let nr = unsafe {
      libc::recv(
        self.fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        libc::MSG_DONTWAIT,
      )
    };
    if nr < 0 {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(libc::ECONNRESET) => Ok(RecvStatus::Closed),
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(RecvStatus::Retry),
        _ => Err(err),
      };
    }
    if nr == 0 {
      return Ok(RecvStatus::Closed);
    }
    Ok(RecvStatus::Data(nr as usize))
  }

  /// Send `data`, buffering whatever the kernel refuses.
  ///
  /// While the tx buffer is non-empty all new data is appended behind it
  /// so bytes never reorder; the caller keeps write interest registered
  /// until [`TcpSocket::flush`] reports the buffer drained.
  pub fn send(&self, data: &[u8]) -> io::Result<SendStatus> {
    let mut tx = self.tx.borrow_mut();

    if !tx.is_empty() {
      tx.extend_from_slice(data);
      return Ok(SendStatus::Blocked);
    }

    let nr = unsafe {
      libc::send(
        self.fd,
        data.as_ptr() as *const libc::c_void,
        data.len(),
        libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
      )
    };
    if nr < 0 {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::EPIPE) => Ok(SendStatus::Closed),
        Some(libc::EAGAIN) | Some(libc::EINTR) => {
          tx.extend_from_slice(data);
          Ok(SendStatus::Blocked)
        }
        _ => Err(err),
      };
    }

    let nr = nr as usize;
    if nr < data.len() {
      tx.extend_from_slice(&data[nr..]);
      return Ok(SendStatus::Blocked);
    }
    Ok(SendStatus::Done)
  }

  /// Push buffered tx bytes to the kernel after a write-ready event.
  /// [`SendStatus::Done`] means the buffer drained and write interest
  /// can be dropped.
  pub fn flush(&self) -> io::Result<SendStatus> {
    let mut tx = self.tx.borrow_mut();

    if tx.is_empty() {
      return Ok(SendStatus::Done);
    }

    let nr = unsafe {
      libc::send(
        self.fd,
        tx.as_ptr() as *const libc::c_void,
        tx.len(),
        libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
      )
    };
    if nr < 0 {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::EPIPE) => Ok(SendStatus::Closed),
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(SendStatus::Blocked),
        _ => Err(err),
      };
    }

    tx.drain(..nr as usize);
    match tx.is_empty() {
      true => Ok(SendStatus::Done),
      false => Ok(SendStatus::Blocked),
    }
  }

  /// Shut the connection down. The fd itself stays allocated until the
  /// last handle drops, so it cannot be reused out from under an
  /// in-flight descriptor.
  pub fn shutdown(&self) {
    unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
  }
}

impl Drop for TcpSocket {
  fn drop(&mut self) {
    unsafe { libc::close(self.fd) };
  }
}

/// A bound non-blocking UDP socket. Datagram replies carry their
/// destination explicitly; there is no connection state.
pub struct UdpSocket {
  fd: RawFd,
}

unsafe impl Send for UdpSocket {}
unsafe impl Sync for UdpSocket {}

pub fn make_udp_socket(iface: &str, port: u16) -> io::Result<UdpSocket> {
  let addr = parse_iface(iface)?;

  let fd = sysresult!(unsafe {
    libc::socket(
      libc::AF_INET,
      libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
    )
  })?;
  let socket = UdpSocket { fd };

  set_reuse(fd)?;
  bind_to(fd, addr, port)?;

  Ok(socket)
}

impl UdpSocket {
  pub fn fd(&self) -> RawFd {
    self.fd
  }

  pub fn local_port(&self) -> io::Result<u16> {
    bound_port(self.fd)
  }

  /// Receive one datagram; `None` when nothing is pending.
  pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SockAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let nr = unsafe {
      libc::recvfrom(
        self.fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        libc::MSG_DONTWAIT,
        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
        &mut len,
      )
    };
    if nr < 0 {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        // A reset from some previous send is no concern of the next
        // datagram.
        Some(libc::ECONNRESET) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
        _ => Err(err),
      };
    }

    Ok(Some((nr as usize, SockAddr::new(storage, len))))
  }

  /// Send one datagram to `dst`. Datagrams are never fragmented by this
  /// layer; a short send is an error.
  pub fn send_to(&self, data: &[u8], dst: &SockAddr) -> io::Result<SendStatus> {
    let nr = unsafe {
      libc::sendto(
        self.fd,
        data.as_ptr() as *const libc::c_void,
        data.len(),
        libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
        dst.as_ptr(),
        dst.len(),
      )
    };
    if nr < 0 {
      let err = io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::EPIPE) => Ok(SendStatus::Closed),
        _ => Err(err),
      };
    }
    if nr as usize != data.len() {
      return Err(io::Error::new(
        io::ErrorKind::WriteZero,
        "short datagram send",
      ));
    }
    Ok(SendStatus::Done)
  }
}

impl Drop for UdpSocket {
  fn drop(&mut self) {
    unsafe { libc::close(self.fd) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read, Write};
  use std::net::TcpStream;

  #[test]
  fn listener_accepts_and_socket_echoes() {
    let listener = make_tcp_listener("127.0.0.1", 0, 16).unwrap();
    let port = listener.local_port().unwrap();
    assert_ne!(port, 0);
    assert_eq!(listener.accept().unwrap(), None);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let fd = loop {
      if let Some(fd) = listener.accept().unwrap() {
        break fd;
      }
    };
    let socket = TcpSocket::new(fd);
    socket.set_nodelay().unwrap();

    client.write_all(b"ping").unwrap();
    let mut buf = [0u8; 64];
    let nr = loop {
      match socket.recv(&mut buf).unwrap() {
        RecvStatus::Data(nr) => break nr,
        RecvStatus::Retry => continue,
        RecvStatus::Closed => panic!("peer closed unexpectedly"),
      }
    };
    assert_eq!(&buf[..nr], b"ping");

    assert_eq!(socket.send(b"pong").unwrap(), SendStatus::Done);
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");
  }

  #[test]
  fn peer_close_is_reported() {
    let listener = make_tcp_listener("127.0.0.1", 0, 16).unwrap();
    let port = listener.local_port().unwrap();

    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let fd = loop {
      if let Some(fd) = listener.accept().unwrap() {
        break fd;
      }
    };
    let socket = TcpSocket::new(fd);
    drop(client);

    let mut buf = [0u8; 64];
    loop {
      match socket.recv(&mut buf).unwrap() {
        RecvStatus::Closed => break,
        RecvStatus::Retry => continue,
        RecvStatus::Data(_) => panic!("no data was ever sent"),
      }
    }
  }

  #[test]
  fn udp_round_trip() {
    let server = make_udp_socket("127.0.0.1", 0).unwrap();
    let port = server.local_port().unwrap();

    let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"hello", ("127.0.0.1", port)).unwrap();

    let mut buf = [0u8; 64];
    let (nr, src) = loop {
      if let Some(got) = server.recv_from(&mut buf).unwrap() {
        break got;
      }
    };
    assert_eq!(&buf[..nr], b"hello");

    assert_eq!(server.send_to(b"world", &src).unwrap(), SendStatus::Done);
    let mut reply = [0u8; 64];
    let (nr, _) = client.recv_from(&mut reply).unwrap();
    assert_eq!(&reply[..nr], b"world");
  }
}
