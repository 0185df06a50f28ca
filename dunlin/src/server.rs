use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use fxhash::FxHashMap;
use reactor::{
  make_tcp_listener, make_udp_socket, Event, Interest, MeshNode, Reactor, RecvStatus, SendStatus,
  SockAddr, TcpListener, TcpSocket, UdpSocket,
};
use seglog::{Log, LogConfig};

use crate::buffer::Buffer;
use crate::command::{Command, FrameHeader, Opcode, Request, SocketHandle};
use crate::config::Config;
use crate::hash::shard_of;
use crate::protocol::{Parser, State};

const RX_BUF_SIZE: usize = 256 * 1024;

const ERROR_RESPONSE: &[u8] = b"ERROR\r\n";
const STORED_RESPONSE: &[u8] = b"STORED\r\n";
const OOM_RESPONSE: &[u8] = b"SERVER_ERROR out of memory storing object\r\n";
const END_RESPONSE: &[u8] = b"END\r\n";

struct Connection {
  sock: Arc<TcpSocket>,
  rx: Buffer,
}

/// One core's server: the reactor, the log shard, and the sockets this
/// core owns. Commands whose key hashes elsewhere leave as descriptors
/// through the reactor's mesh node and come back as replies.
pub struct Worker {
  reactor: Reactor<Box<Command>>,
  log: Log,
  listener: Option<TcpListener>,
  udp: Option<Arc<UdpSocket>>,
  conns: FxHashMap<RawFd, Connection>,
  rx_scratch: Vec<u8>,
  events: Vec<Event>,
}

impl Worker {
  /// Bind this core's socket and map its memory slice. A nonzero UDP
  /// port selects datagram service instead of TCP.
  pub fn new(config: &Config, node: MeshNode<Box<Command>>) -> io::Result<Self> {
    let log = Log::new(&LogConfig {
      memory_size: config.per_thread_memory(),
      segment_size: config.segment_bytes(),
    })?;
    let mut reactor = Reactor::new(node)?;

    let (listener, udp) = if config.udp_port != 0 {
      let sock = Arc::new(make_udp_socket(&config.listen_addr, config.udp_port)?);
      reactor.register(sock.fd(), Interest::READ)?;
      (None, Some(sock))
    } else {
      let listener = make_tcp_listener(&config.listen_addr, config.tcp_port, config.listen_backlog)?;
      reactor.register(listener.fd(), Interest::READ)?;
      (Some(listener), None)
    };

    Ok(Self {
      reactor,
      log,
      listener,
      udp,
      conns: FxHashMap::default(),
      rx_scratch: vec![0; RX_BUF_SIZE],
      events: Vec::new(),
    })
  }

  pub fn thread_id(&self) -> usize {
    self.reactor.thread_id()
  }

  /// The port this worker's socket is bound to.
  pub fn local_port(&self) -> io::Result<u16> {
    match (&self.listener, &self.udp) {
      (Some(listener), _) => listener.local_port(),
      (None, Some(sock)) => sock.local_port(),
      (None, None) => unreachable!("worker owns either a listener or a udp socket"),
    }
  }

  /// Run the event loop until process termination.
  ///
  /// Each iteration: signal pending wakeups, drain the inboxes, then
  /// either poll optimistically (messages were seen, more are likely) or
  /// go through the sleep handshake and block. The recheck between
  /// publishing the sleep flag and blocking closes the race with a
  /// producer that enqueued after the drain.
  pub fn run(&mut self) -> io::Result<()> {
    loop {
      self.reactor.flush_wakeups()?;

      let had_messages = self.drain_messages()?;
      let timeout_ms = match had_messages {
        true => 0,
        false => {
          self.reactor.set_sleeping(true);
          if self.reactor.has_messages() {
            self.reactor.set_sleeping(false);
            continue;
          }
          -1
        }
      };

      let mut events = mem::take(&mut self.events);
      let result = self.reactor.poll(&mut events, timeout_ms);
      if timeout_ms != 0 {
        self.reactor.set_sleeping(false);
      }
      result?;

      for i in 0..events.len() {
        self.dispatch(events[i])?;
      }
      self.events = events;
    }
  }

  fn drain_messages(&mut self) -> io::Result<bool> {
    let mut had_messages = false;
    while let Some(cmd) = self.reactor.recv_msg() {
      had_messages = true;
      self.on_message(cmd)?;
    }
    Ok(had_messages)
  }

  /// Execute a descriptor. Requests run against the local log and turn
  /// into replies headed back to their origin; replies get written to
  /// the socket they came from and die here.
  fn on_message(&mut self, mut cmd: Box<Command>) -> io::Result<()> {
    match cmd.op {
      Opcode::Set => {
        let blob = cmd.blob.take().unwrap_or_default();
        cmd.op = match self.log.append(&cmd.key, &blob) {
          true => Opcode::SetOk,
          false => Opcode::SetOom,
        };
        let origin = cmd.origin;
        self.send_to_core(origin, cmd);
      }
      Opcode::Get => {
        // Format the reply here, while the blob view into this core's
        // log is still valid; the origin only writes bytes.
        let mut reply = cmd.req.new_reply();
        if let Some(blob) = self.log.find(&cmd.key) {
          append_value(&mut reply, &cmd.key, blob);
        }
        reply.extend_from_slice(END_RESPONSE);
        cmd.reply = reply;
        cmd.op = Opcode::GetOk;
        let origin = cmd.origin;
        self.send_to_core(origin, cmd);
      }
      Opcode::SetOk => {
        let mut reply = cmd.req.new_reply();
        reply.extend_from_slice(STORED_RESPONSE);
        self.send_reply(&cmd.req, &reply)?;
      }
      Opcode::SetOom => {
        let mut reply = cmd.req.new_reply();
        reply.extend_from_slice(OOM_RESPONSE);
        self.send_reply(&cmd.req, &reply)?;
      }
      Opcode::GetOk => {
        let reply = mem::take(&mut cmd.reply);
        self.send_reply(&cmd.req, &reply)?;
      }
    }
    Ok(())
  }

  fn dispatch(&mut self, event: Event) -> io::Result<()> {
    if Some(event.fd) == self.listener.as_ref().map(TcpListener::fd) {
      return self.on_accept();
    }
    if Some(event.fd) == self.udp.as_deref().map(UdpSocket::fd) {
      return self.on_udp_readable();
    }

    if event.error {
      return self.close_conn(event.fd);
    }
    if event.readable {
      self.on_tcp_readable(event.fd)?;
    }
    if event.writable {
      self.on_tcp_writable(event.fd)?;
    }
    Ok(())
  }

  fn on_accept(&mut self) -> io::Result<()> {
    loop {
      let accepted = match &self.listener {
        Some(listener) => listener.accept()?,
        None => return Ok(()),
      };
      let fd = match accepted {
        Some(fd) => fd,
        None => return Ok(()),
      };

      let sock = Arc::new(TcpSocket::new(fd));
      sock.set_nodelay()?;
      self.reactor.register(fd, Interest::READ)?;
      self.conns.insert(
        fd,
        Connection {
          sock,
          rx: Buffer::new(),
        },
      );
      debug!("core {}: accepted connection fd {}", self.thread_id(), fd);
    }
  }

  fn on_tcp_readable(&mut self, fd: RawFd) -> io::Result<()> {
    let sock = match self.conns.get(&fd) {
      Some(conn) => Arc::clone(&conn.sock),
      None => return Ok(()),
    };

    let mut scratch = mem::take(&mut self.rx_scratch);
    let result = match sock.recv(&mut scratch) {
      Ok(RecvStatus::Data(nr)) => self.on_recv(fd, &scratch[..nr]),
      Ok(RecvStatus::Closed) => self.close_conn(fd),
      Ok(RecvStatus::Retry) => Ok(()),
      Err(err) => {
        warn!("core {}: recv on fd {}: {}", self.thread_id(), fd, err);
        self.close_conn(fd)
      }
    };
    self.rx_scratch = scratch;

    result
  }

  /// Feed received bytes through the parser, command by command.
  /// Partial commands wait in the connection's rx buffer; everything
  /// else is consumed where it arrived.
  fn on_recv(&mut self, fd: RawFd, bytes: &[u8]) -> io::Result<()> {
    let (sock, mut rx) = match self.conns.get_mut(&fd) {
      Some(conn) => (Arc::clone(&conn.sock), mem::take(&mut conn.rx)),
      None => return Ok(()),
    };
    let handle = SocketHandle::Tcp(sock);

    if rx.is_empty() {
      let mut msg = bytes;
      loop {
        if !msg.contains(&b'\n') {
          rx.append(msg);
          break;
        }
        let nr_consumed = self.process_one(&handle, None, None, msg)?;
        if nr_consumed == 0 {
          rx.append(msg);
          break;
        }
        msg = &msg[nr_consumed..];
      }
    } else {
      rx.append(bytes);
      loop {
        if !rx.as_slice().contains(&b'\n') {
          break;
        }
        let nr_consumed = self.process_one(&handle, None, None, rx.as_slice())?;
        if nr_consumed == 0 {
          break;
        }
        rx.remove_prefix(nr_consumed);
      }
    }

    if let Some(conn) = self.conns.get_mut(&fd) {
      conn.rx = rx;
    }
    Ok(())
  }

  fn on_udp_readable(&mut self) -> io::Result<()> {
    let sock = match &self.udp {
      Some(sock) => Arc::clone(sock),
      None => return Ok(()),
    };

    let mut scratch = mem::take(&mut self.rx_scratch);
    let result = match sock.recv_from(&mut scratch) {
      Ok(Some((nr, src))) => self.on_datagram(&sock, src, &scratch[..nr]),
      Ok(None) => Ok(()),
      Err(err) => Err(err),
    };
    self.rx_scratch = scratch;

    result
  }

  /// One datagram carries one framed command; replies echo the frame.
  fn on_datagram(&mut self, sock: &Arc<UdpSocket>, src: SockAddr, datagram: &[u8]) -> io::Result<()> {
    let (frame, msg) = match FrameHeader::parse(datagram) {
      Some(parsed) => parsed,
      None => {
        debug!("core {}: dropping short datagram", self.thread_id());
        return Ok(());
      }
    };

    let handle = SocketHandle::Udp(Arc::clone(sock));
    self.process_one(&handle, Some(src), Some(frame), msg)?;
    Ok(())
  }

  fn on_tcp_writable(&mut self, fd: RawFd) -> io::Result<()> {
    let sock = match self.conns.get(&fd) {
      Some(conn) => Arc::clone(&conn.sock),
      None => return Ok(()),
    };

    match sock.flush() {
      Ok(SendStatus::Done) => self.reactor.register(fd, Interest::READ),
      Ok(SendStatus::Blocked) => Ok(()),
      Ok(SendStatus::Closed) => self.close_conn(fd),
      Err(err) => {
        warn!("core {}: flush on fd {}: {}", self.thread_id(), fd, err);
        self.close_conn(fd)
      }
    }
  }

  /// Parse and execute one command out of `msg`. Returns the bytes
  /// consumed; zero means an incomplete `set` that needs more bytes.
  fn process_one(
    &mut self,
    sock: &SocketHandle,
    dst: Option<SockAddr>,
    frame: Option<FrameHeader>,
    msg: &[u8],
  ) -> io::Result<usize> {
    let mut parser = Parser::new();
    let mut nr_consumed = parser.parse(msg);

    match parser.state {
      State::Error => {
        // Resync past the offending line and keep the connection.
        nr_consumed = match msg.iter().position(|&byte| byte == b'\n') {
          Some(pos) => pos + 1,
          None => msg.len(),
        };
        let req = Request {
          sock: sock.clone(),
          dst,
          frame,
        };
        let mut reply = req.new_reply();
        reply.extend_from_slice(ERROR_RESPONSE);
        self.send_reply(&req, &reply)?;
      }
      State::CmdSet => {
        let data_block_size = parser.blob_size + 2;
        if msg.len() < nr_consumed + data_block_size {
          return Ok(0);
        }
        nr_consumed += data_block_size;

        let key = parser.key(msg);
        let blob = &msg[parser.blob_start..parser.blob_start + parser.blob_size];
        let req = Request {
          sock: sock.clone(),
          dst,
          frame,
        };

        let target = shard_of(key, self.reactor.nr_threads());
        if target == self.thread_id() {
          let mut reply = req.new_reply();
          reply.extend_from_slice(match self.log.append(key, blob) {
            true => STORED_RESPONSE,
            false => OOM_RESPONSE,
          });
          self.send_reply(&req, &reply)?;
        } else {
          let cmd = Box::new(Command {
            op: Opcode::Set,
            origin: self.thread_id(),
            key: key.into(),
            blob: Some(blob.into()),
            reply: Vec::new(),
            req,
          });
          self.send_to_core(target, cmd);
        }
      }
      State::CmdGet => {
        let key = parser.key(msg);
        let req = Request {
          sock: sock.clone(),
          dst,
          frame,
        };

        let target = shard_of(key, self.reactor.nr_threads());
        if target == self.thread_id() {
          let mut reply = req.new_reply();
          if let Some(blob) = self.log.find(key) {
            append_value(&mut reply, key, blob);
          }
          reply.extend_from_slice(END_RESPONSE);
          self.send_reply(&req, &reply)?;
        } else {
          let cmd = Box::new(Command {
            op: Opcode::Get,
            origin: self.thread_id(),
            key: key.into(),
            blob: None,
            reply: Vec::new(),
            req,
          });
          self.send_to_core(target, cmd);
        }
      }
      State::Initial => unreachable!("parse always leaves the initial state"),
    }

    Ok(nr_consumed)
  }

  /// Ship a descriptor to another core's inbox.
  ///
  /// A full inbox is unrecoverable from here: the descriptor cannot be
  /// parked anywhere and dropping it would lose a client's command.
  fn send_to_core(&mut self, target: usize, cmd: Box<Command>) {
    if self.reactor.send_msg(target, cmd).is_err() {
      panic!(
        "core {}: message queue to core {} is full",
        self.thread_id(),
        target
      );
    }
  }

  /// Write a reply to its request's socket, adjusting write interest or
  /// closing per the send outcome.
  fn send_reply(&mut self, req: &Request, reply: &[u8]) -> io::Result<()> {
    match req.send(reply) {
      Ok(SendStatus::Done) => Ok(()),
      Ok(SendStatus::Blocked) => {
        if let SocketHandle::Tcp(sock) = &req.sock {
          self
            .reactor
            .register(sock.fd(), Interest::READ | Interest::WRITE)?;
        }
        Ok(())
      }
      Ok(SendStatus::Closed) => match &req.sock {
        SocketHandle::Tcp(sock) => self.close_conn(sock.fd()),
        SocketHandle::Udp(_) => Ok(()),
      },
      Err(err) => {
        warn!("core {}: send: {}", self.thread_id(), err);
        match &req.sock {
          SocketHandle::Tcp(sock) => self.close_conn(sock.fd()),
          SocketHandle::Udp(_) => Ok(()),
        }
      }
    }
  }

  /// Tear a connection down: out of the poll set, shut down, and out of
  /// the table. The fd itself is released when the last descriptor
  /// holding the socket drops.
  fn close_conn(&mut self, fd: RawFd) -> io::Result<()> {
    if let Some(conn) = self.conns.remove(&fd) {
      debug!("core {}: closing connection fd {}", self.thread_id(), fd);
      self.reactor.deregister(fd)?;
      conn.sock.shutdown();
    }
    Ok(())
  }
}

fn append_value(out: &mut Vec<u8>, key: &[u8], blob: &[u8]) {
  out.extend_from_slice(b"VALUE ");
  out.extend_from_slice(key);
  out.extend_from_slice(b" 0 ");
  out.extend_from_slice(blob.len().to_string().as_bytes());
  out.extend_from_slice(b"\r\n");
  out.extend_from_slice(blob);
  out.extend_from_slice(b"\r\n");
}
