use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use reactor::{SendStatus, SockAddr, TcpSocket, UdpSocket};

/// What a descriptor asks for, or how it turned out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
  Set,
  SetOk,
  SetOom,
  Get,
  GetOk,
}

pub const FRAME_HEADER_SIZE: usize = 8;

/// The 8-byte memcache UDP frame header. Replies echo the request id
/// and sequence number; this cache never splits a reply, so the
/// datagram count is always one.
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
  pub request_id: u16,
  pub sequence_num: u16,
}

impl FrameHeader {
  /// Split a datagram into its frame header and payload. Datagrams too
  /// short for a header yield `None` and are dropped by the caller.
  pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
    if datagram.len() < FRAME_HEADER_SIZE {
      return None;
    }

    let frame = Self {
      request_id: u16::from_be_bytes([datagram[0], datagram[1]]),
      sequence_num: u16::from_be_bytes([datagram[2], datagram[3]]),
    };
    Some((frame, &datagram[FRAME_HEADER_SIZE..]))
  }

  pub fn encode_into(&self, out: &mut Vec<u8>) {
    out.extend_from_slice(&self.request_id.to_be_bytes());
    out.extend_from_slice(&self.sequence_num.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // nr_datagrams
    out.extend_from_slice(&0u16.to_be_bytes()); // reserved
  }
}

/// Counted handle to the socket a reply must go out on.
#[derive(Clone)]
pub enum SocketHandle {
  Tcp(Arc<TcpSocket>),
  Udp(Arc<UdpSocket>),
}

impl SocketHandle {
  pub fn fd(&self) -> RawFd {
    match self {
      SocketHandle::Tcp(sock) => sock.fd(),
      SocketHandle::Udp(sock) => sock.fd(),
    }
  }
}

/// Context of one inbound datagram or parsed TCP command: where the
/// reply goes, and for UDP, the destination address and frame to echo.
#[derive(Clone)]
pub struct Request {
  pub sock: SocketHandle,
  pub dst: Option<SockAddr>,
  pub frame: Option<FrameHeader>,
}

impl Request {
  /// Start a reply buffer; UDP replies begin with the echoed frame.
  pub fn new_reply(&self) -> Vec<u8> {
    let mut reply = Vec::new();
    if let Some(frame) = &self.frame {
      frame.encode_into(&mut reply);
    }
    reply
  }

  pub fn send(&self, reply: &[u8]) -> io::Result<SendStatus> {
    match (&self.sock, &self.dst) {
      (SocketHandle::Tcp(sock), _) => sock.send(reply),
      (SocketHandle::Udp(sock), Some(dst)) => sock.send_to(reply, dst),
      (SocketHandle::Udp(_), None) => unreachable!("udp request without a source address"),
    }
  }
}

/// A cross-core command descriptor.
///
/// Created on the origin core, shipped to the key's owner, mutated into
/// its reply form there, shipped back, and destroyed on the origin core
/// once the reply has been written. The request context keeps the
/// originating socket alive for exactly that long.
pub struct Command {
  pub op: Opcode,
  /// Core that created the descriptor and writes the reply.
  pub origin: usize,
  pub key: Box<[u8]>,
  /// Inbound value for Set.
  pub blob: Option<Box<[u8]>>,
  /// Reply text for GetOk, formatted on the owner core while its blob
  /// view is still valid.
  pub reply: Vec<u8>,
  pub req: Request,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_round_trip() {
    let datagram = [0x01, 0x02, 0x03, 0x04, 0x00, 0x01, 0x00, 0x00, b'g', b'e', b't'];
    let (frame, payload) = FrameHeader::parse(&datagram).unwrap();

    assert_eq!(frame.request_id, 0x0102);
    assert_eq!(frame.sequence_num, 0x0304);
    assert_eq!(payload, b"get");

    let mut out = Vec::new();
    frame.encode_into(&mut out);
    assert_eq!(out, [0x01, 0x02, 0x03, 0x04, 0x00, 0x01, 0x00, 0x00]);
  }

  #[test]
  fn short_datagrams_have_no_frame() {
    assert!(FrameHeader::parse(b"1234567").is_none());
    assert!(FrameHeader::parse(b"").is_none());
  }
}
