//! Shared harness: one stack under test against a scripted golden peer.
//!
//! The harness owns the clock. Segments the peer "sends" are built with real
//! checksums and injected at the stack's ingress; segments the stack emits
//! are pulled through the packet pump and decoded for assertions.

#![allow(dead_code)]

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use surge_packet::checksum::{sum_pseudo_header_v4, Checksummer};
use surge_packet::tcp::{TcpHeader, TcpOption, TCP_HEADER_LEN};
use surge_packet::Packet;
use surge_tcp::{Duration, Instant, Ipv4Inet, SocketAddress, Tcp};

pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
pub const PEER_PORT: u16 = 80;
pub const MSS: usize = 1460;
pub const PEER_ISS: u32 = 0x1000_0000;
/// The window the golden peer advertises in its SYN (unscaled) and in later
/// segments (scaled by `PEER_WSCALE`).
pub const PEER_WINDOW: u16 = 29200;
pub const PEER_WSCALE: u8 = 7;

/// A decoded segment pulled from the stack.
#[derive(Debug)]
pub struct Segment {
  pub th: TcpHeader,
  pub options: Vec<u8>,
  pub payload: Vec<u8>,
}

impl Segment {
  pub fn parse(p: &Packet) -> Segment {
    let bytes = p.to_vec();
    let th = TcpHeader::parse(&bytes).expect("stack emitted an unparseable header");
    assert!(th.header_len() <= bytes.len());
    Segment {
      options: bytes[TCP_HEADER_LEN..th.header_len()].to_vec(),
      payload: bytes[th.header_len()..].to_vec(),
      th,
    }
  }

  /// Decode the MSS and window-scale options, if present.
  pub fn decoded_options(&self) -> (Option<u16>, Option<u8>) {
    let mut mss = None;
    let mut wscale = None;
    let mut rest = &self.options[..];
    while !rest.is_empty() {
      match TcpOption::parse(rest) {
        Ok((r, TcpOption::MaxSegmentSize(v))) => {
          mss = Some(v);
          rest = r;
        }
        Ok((r, TcpOption::WindowScale(v))) => {
          wscale = Some(v);
          rest = r;
        }
        Ok((_, TcpOption::EndOfList)) | Err(()) => break,
        Ok((r, _)) => rest = r,
      }
    }
    (mss, wscale)
  }

  pub fn seg_len(&self) -> u32 {
    self.payload.len() as u32 + self.th.f_syn as u32 + self.th.f_fin as u32
  }
}

/// Builder for segments the golden peer injects.
pub struct SegBuilder {
  pub src_port: u16,
  pub dst_port: u16,
  pub seq: u32,
  pub ack: Option<u32>,
  pub window: u16,
  pub syn: bool,
  pub fin: bool,
  pub rst: bool,
  pub mss: Option<u16>,
  pub wscale: Option<u8>,
  pub payload: Vec<u8>,
}

impl SegBuilder {
  pub fn new(src_port: u16, dst_port: u16) -> SegBuilder {
    SegBuilder {
      src_port,
      dst_port,
      seq: 0,
      ack: None,
      window: PEER_WINDOW,
      syn: false,
      fin: false,
      rst: false,
      mss: None,
      wscale: None,
      payload: Vec::new(),
    }
  }

  pub fn seq(mut self, seq: u32) -> SegBuilder {
    self.seq = seq;
    self
  }

  pub fn ack(mut self, ack: u32) -> SegBuilder {
    self.ack = Some(ack);
    self
  }

  pub fn window(mut self, window: u16) -> SegBuilder {
    self.window = window;
    self
  }

  pub fn syn(mut self) -> SegBuilder {
    self.syn = true;
    self
  }

  pub fn fin(mut self) -> SegBuilder {
    self.fin = true;
    self
  }

  pub fn rst(mut self) -> SegBuilder {
    self.rst = true;
    self
  }

  pub fn mss_opt(mut self, mss: u16) -> SegBuilder {
    self.mss = Some(mss);
    self
  }

  pub fn wscale_opt(mut self, shift: u8) -> SegBuilder {
    self.wscale = Some(shift);
    self
  }

  pub fn payload(mut self, data: &[u8]) -> SegBuilder {
    self.payload = data.to_vec();
    self
  }

  pub fn build(self) -> Packet {
    let mut options = Vec::new();
    if let Some(mss) = self.mss {
      let mut buf = [0u8; 4];
      TcpOption::MaxSegmentSize(mss).build(&mut buf);
      options.extend_from_slice(&buf);
    }
    if let Some(shift) = self.wscale {
      let mut buf = [0u8; 3];
      TcpOption::WindowScale(shift).build(&mut buf);
      options.extend_from_slice(&buf);
      options.push(0x01); // NOP pad
    }
    assert_eq!(options.len() % 4, 0);

    let th = TcpHeader {
      src_port: self.src_port,
      dst_port: self.dst_port,
      seq: self.seq,
      ack: self.ack.unwrap_or(0),
      data_offset: ((TCP_HEADER_LEN + options.len()) / 4) as u8,
      f_syn: self.syn,
      f_fin: self.fin,
      f_rst: self.rst,
      f_ack: self.ack.is_some(),
      window: self.window,
      ..TcpHeader::default()
    };

    let total = TCP_HEADER_LEN + options.len() + self.payload.len();
    let mut bytes = BytesMut::zeroed(total);
    th.build(&mut bytes);
    bytes[TCP_HEADER_LEN..TCP_HEADER_LEN + options.len()].copy_from_slice(&options);
    bytes[TCP_HEADER_LEN + options.len()..].copy_from_slice(&self.payload);

    let mut csum = Checksummer::new();
    sum_pseudo_header_v4(&mut csum, PEER_IP, LOCAL_IP, surge_packet::IP_PROTO_TCP, total);
    csum.sum(&bytes);
    let checksum = csum.get();
    bytes[16..18].copy_from_slice(&checksum.to_be_bytes());

    Packet::from_bytes(bytes.freeze())
  }
}

pub struct Harness {
  pub tcp: Tcp<Ipv4Inet>,
  pub now: Instant,
}

impl Harness {
  pub fn new() -> Harness {
    Harness {
      tcp: Tcp::new(Ipv4Inet::new(LOCAL_IP)),
      now: Instant::from_millis(0),
    }
  }

  pub fn peer_addr(&self) -> SocketAddress<Ipv4Addr> {
    SocketAddress {
      addr: PEER_IP,
      port: PEER_PORT,
    }
  }

  /// Move the clock and fire any timers that came due.
  pub fn advance(&mut self, d: Duration) {
    self.now += d;
    self.tcp.on_timers(self.now);
  }

  pub fn inject(&mut self, p: Packet) {
    self.tcp.received(p, PEER_IP, LOCAL_IP, self.now);
  }

  /// Pull and decode every packet the stack has ready.
  pub fn pump(&mut self) -> Vec<Segment> {
    let mut segs = Vec::new();
    while let Some(l4p) = self.tcp.poll_packet(self.now) {
      assert_eq!(l4p.to, PEER_IP);
      segs.push(Segment::parse(&l4p.p));
    }
    segs
  }

  pub fn pump_one(&mut self) -> Option<Segment> {
    self.tcp.poll_packet(self.now).map(|l4p| Segment::parse(&l4p.p))
  }
}

pub fn poll_once<F: Future>(fut: &mut Pin<Box<F>>) -> Poll<F::Output> {
  let waker = futures::task::noop_waker();
  let mut cx = Context::from_waker(&waker);
  fut.as_mut().poll(&mut cx)
}

/// Drive an active-open handshake against the golden peer at time `h.now`.
/// Returns the established connection and the local ISS.
pub fn establish(h: &mut Harness) -> (surge_tcp::Connection<Ipv4Inet>, u32, u16) {
  let mut fut = Box::pin(h.tcp.connect(h.peer_addr(), h.now));
  assert!(poll_once(&mut fut).is_pending());

  let segs = h.pump();
  assert_eq!(segs.len(), 1, "expected exactly the SYN");
  let syn = &segs[0];
  assert!(syn.th.f_syn && !syn.th.f_ack);
  let iss = syn.th.seq;
  let local_port = syn.th.src_port;

  // SYN|ACK after a 10ms round trip
  h.advance(Duration::from_millis(10));
  h.inject(
    SegBuilder::new(PEER_PORT, local_port)
      .seq(PEER_ISS)
      .ack(iss.wrapping_add(1))
      .syn()
      .mss_opt(MSS as u16)
      .wscale_opt(PEER_WSCALE)
      .window(PEER_WINDOW)
      .build(),
  );

  let conn = match poll_once(&mut fut) {
    Poll::Ready(Ok(conn)) => conn,
    other => panic!("connect did not complete: {:?}", other.map(|r| r.map(|_| ()))),
  };

  // the handshake-completing empty ACK
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let ack = &segs[0];
  assert!(ack.th.f_ack && !ack.th.f_syn);
  assert_eq!(ack.th.seq, iss.wrapping_add(1));
  assert_eq!(ack.th.ack, PEER_ISS.wrapping_add(1));
  assert!(ack.payload.is_empty());

  (conn, iss, local_port)
}

/// Peer-side bookkeeping for an established golden-peer conversation.
pub struct PeerState {
  pub local_port: u16,
  /// Next sequence number the peer will send.
  pub snd_nxt: u32,
  /// Next local sequence number the peer expects (equals its ACK value).
  pub rcv_nxt: u32,
}

impl PeerState {
  pub fn after_establish(iss: u32, local_port: u16) -> PeerState {
    PeerState {
      local_port,
      snd_nxt: PEER_ISS.wrapping_add(1),
      rcv_nxt: iss.wrapping_add(1),
    }
  }

  pub fn seg(&self) -> SegBuilder {
    SegBuilder::new(PEER_PORT, self.local_port)
      .seq(self.snd_nxt)
      .ack(self.rcv_nxt)
      .window(PEER_WINDOW)
  }

  /// Acknowledge `len` more bytes from the stack.
  pub fn ack_bytes(&mut self, len: u32) -> SegBuilder {
    self.rcv_nxt = self.rcv_nxt.wrapping_add(len);
    self.seg()
  }

  /// A data segment from the peer, advancing its send sequence.
  pub fn data(&mut self, payload: &[u8]) -> SegBuilder {
    let b = self.seg().payload(payload);
    self.snd_nxt = self.snd_nxt.wrapping_add(payload.len() as u32);
    b
  }
}
