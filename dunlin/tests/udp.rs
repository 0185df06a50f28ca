//! End-to-end tests for datagram service and the 8-byte frame protocol.

use std::net::UdpSocket;
use std::time::Duration;

use dunlin::Config;

fn udp_config(udp_port: u16) -> Config {
  Config {
    tcp_port: 0,
    udp_port,
    listen_addr: "127.0.0.1".to_string(),
    memory_limit: 8,
    segment_size: 1,
    listen_backlog: 128,
    nr_threads: 1,
    isolate_cpus: Vec::new(),
    sched_fifo: false,
  }
}

fn fixed_port(offset: u16) -> u16 {
  // Offsets here must not collide with the TCP test file's.
  21000 + (std::process::id() % 20000) as u16 + offset
}

fn frame(request_id: u16, sequence_num: u16) -> [u8; 8] {
  let id = request_id.to_be_bytes();
  let seq = sequence_num.to_be_bytes();
  [id[0], id[1], seq[0], seq[1], 0, 1, 0, 0]
}

fn client() -> UdpSocket {
  let client = UdpSocket::bind("127.0.0.1:0").unwrap();
  client
    .set_read_timeout(Some(Duration::from_secs(5)))
    .unwrap();
  client
}

fn exchange(client: &UdpSocket, port: u16, request_id: u16, command: &[u8]) -> Vec<u8> {
  let mut msg = frame(request_id, 0).to_vec();
  msg.extend_from_slice(command);
  client.send_to(&msg, ("127.0.0.1", port)).unwrap();

  let mut buf = [0u8; 64 * 1024];
  let (nr, _) = client.recv_from(&mut buf).unwrap();
  buf[..nr].to_vec()
}

#[test]
fn set_and_get_over_udp() {
  let port = fixed_port(0);
  dunlin::spawn(udp_config(port)).unwrap();
  let client = client();

  // Every reply starts with the echoed frame header.
  let reply = exchange(&client, port, 0x1234, b"set foo 0 0 3\r\nbar\r\n");
  let mut expected = frame(0x1234, 0).to_vec();
  expected.extend_from_slice(b"STORED\r\n");
  assert_eq!(reply, expected);

  let reply = exchange(&client, port, 0x1235, b"get foo\r\n");
  let mut expected = frame(0x1235, 0).to_vec();
  expected.extend_from_slice(b"VALUE foo 0 3\r\nbar\r\nEND\r\n");
  assert_eq!(reply, expected);
}

#[test]
fn get_miss_over_udp() {
  let port = fixed_port(1);
  dunlin::spawn(udp_config(port)).unwrap();
  let client = client();

  let reply = exchange(&client, port, 7, b"get absent\r\n");
  let mut expected = frame(7, 0).to_vec();
  expected.extend_from_slice(b"END\r\n");
  assert_eq!(reply, expected);
}

#[test]
fn bad_command_over_udp() {
  let port = fixed_port(2);
  dunlin::spawn(udp_config(port)).unwrap();
  let client = client();

  let reply = exchange(&client, port, 9, b"nonsense\r\n");
  let mut expected = frame(9, 0).to_vec();
  expected.extend_from_slice(b"ERROR\r\n");
  assert_eq!(reply, expected);
}

#[test]
fn short_datagram_is_dropped_silently() {
  let port = fixed_port(3);
  dunlin::spawn(udp_config(port)).unwrap();

  let client = UdpSocket::bind("127.0.0.1:0").unwrap();
  client
    .set_read_timeout(Some(Duration::from_millis(300)))
    .unwrap();

  client.send_to(b"1234", ("127.0.0.1", port)).unwrap();
  let mut buf = [0u8; 64];
  let err = client.recv_from(&mut buf).unwrap_err();
  assert!(
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
    "expected a receive timeout, got {:?}",
    err
  );

  // The worker is still alive and serving.
  let client = self::client();
  let reply = exchange(&client, port, 1, b"get absent\r\n");
  let mut expected = frame(1, 0).to_vec();
  expected.extend_from_slice(b"END\r\n");
  assert_eq!(reply, expected);
}
