mod common;

use common::*;
use std::task::Poll;
use surge_tcp::{Duration, State, TcpError};

#[test]
fn three_way_handshake() {
  let mut h = Harness::new();
  let mut fut = Box::pin(h.tcp.connect(h.peer_addr(), h.now));
  assert!(poll_once(&mut fut).is_pending());

  // the SYN: MSS and window scale offered, window field unscaled
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let syn = &segs[0];
  assert!(syn.th.f_syn && !syn.th.f_ack && !syn.th.f_fin);
  assert!(syn.payload.is_empty());
  let (mss, wscale) = syn.decoded_options();
  assert_eq!(mss, Some(1460));
  assert_eq!(wscale, Some(7));
  assert_eq!(syn.th.window, 29200);
  let iss = syn.th.seq;
  let local_port = syn.th.src_port;
  assert!((41952..=65535).contains(&local_port));

  // nothing else to send while waiting for the SYN|ACK
  assert!(h.pump().is_empty());
  assert!(poll_once(&mut fut).is_pending());

  h.advance(Duration::from_millis(10));
  h.inject(
    SegBuilder::new(PEER_PORT, local_port)
      .seq(PEER_ISS)
      .ack(iss.wrapping_add(1))
      .syn()
      .mss_opt(1460)
      .wscale_opt(PEER_WSCALE)
      .window(PEER_WINDOW)
      .build(),
  );

  let conn = match poll_once(&mut fut) {
    Poll::Ready(Ok(conn)) => conn,
    _ => panic!("connect did not resolve"),
  };
  assert_eq!(conn.state(), State::Established);

  // the completing empty ACK: seq=ISS+1, ack=PEER_ISS+1
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let ack = &segs[0];
  assert!(ack.th.f_ack && !ack.th.f_syn);
  assert_eq!(ack.th.seq, iss.wrapping_add(1));
  assert_eq!(ack.th.ack, PEER_ISS.wrapping_add(1));
  assert!(ack.payload.is_empty());
}

#[test]
fn stray_syn_elicits_rst() {
  let mut h = Harness::new();
  // no listener, no TCB: <SEQ=0><ACK=SEG.SEQ+1><CTL=RST,ACK>
  h.inject(SegBuilder::new(12345, 7777).seq(0x4242).syn().build());
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let rst = &segs[0];
  assert!(rst.th.f_rst && rst.th.f_ack);
  assert_eq!(rst.th.seq, 0);
  assert_eq!(rst.th.ack, 0x4243);
  assert_eq!(rst.th.src_port, 7777);
  assert_eq!(rst.th.dst_port, 12345);
}

#[test]
fn stray_ack_elicits_rst_from_ack_number() {
  let mut h = Harness::new();
  // <SEQ=SEG.ACK><CTL=RST>
  h.inject(SegBuilder::new(12345, 7777).seq(0x4242).ack(0x1111).build());
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let rst = &segs[0];
  assert!(rst.th.f_rst && !rst.th.f_ack);
  assert_eq!(rst.th.seq, 0x1111);
}

#[test]
fn rst_is_never_answered() {
  let mut h = Harness::new();
  h.inject(SegBuilder::new(12345, 7777).seq(0x4242).rst().build());
  assert!(h.pump().is_empty());
}

#[test]
fn bad_checksum_is_dropped() {
  let mut h = Harness::new();
  let mut p = SegBuilder::new(12345, 7777).seq(0x4242).syn().build();
  let mut bytes = p.to_vec();
  bytes[17] ^= 0xff;
  p = surge_packet::Packet::from_slice(&bytes);
  h.inject(p);
  assert!(h.pump().is_empty());
}

#[test]
fn passive_accept() {
  let mut h = Harness::new();
  let listener = h.tcp.listen(80).unwrap();
  let mut accept = Box::pin(listener.accept());
  assert!(poll_once(&mut accept).is_pending());

  // SYN from the peer
  h.inject(
    SegBuilder::new(5555, 80)
      .seq(PEER_ISS)
      .syn()
      .mss_opt(1460)
      .wscale_opt(PEER_WSCALE)
      .window(PEER_WINDOW)
      .build(),
  );

  // SYN|ACK with our MSS, echoing window scaling
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  let synack = &segs[0];
  assert!(synack.th.f_syn && synack.th.f_ack);
  assert_eq!(synack.th.ack, PEER_ISS.wrapping_add(1));
  let (mss, wscale) = synack.decoded_options();
  assert_eq!(mss, Some(1460));
  assert_eq!(wscale, Some(7));
  let iss = synack.th.seq;

  // the connection is queued already, in SYN-RECEIVED
  let conn = match poll_once(&mut accept) {
    Poll::Ready(conn) => conn,
    Poll::Pending => panic!("accept did not resolve"),
  };
  assert_eq!(conn.state(), State::SynReceived);
  assert_eq!(conn.peer().port, 5555);

  // handshake-completing ACK
  h.inject(
    SegBuilder::new(5555, 80)
      .seq(PEER_ISS.wrapping_add(1))
      .ack(iss.wrapping_add(1))
      .build(),
  );
  assert_eq!(conn.state(), State::Established);

  // data flows
  h.inject(
    SegBuilder::new(5555, 80)
      .seq(PEER_ISS.wrapping_add(1))
      .ack(iss.wrapping_add(1))
      .payload(b"hello surge")
      .build(),
  );
  let mut wait = Box::pin(conn.wait_for_data());
  assert!(matches!(poll_once(&mut wait), Poll::Ready(Ok(()))));
  assert_eq!(conn.read().to_vec(), b"hello surge");
}

#[test]
fn listener_backlog_full_resets_new_syns() {
  let mut h = Harness::new();
  let _listener = h.tcp.listen_with_backlog(80, 1).unwrap();

  h.inject(SegBuilder::new(1000, 80).seq(1).syn().mss_opt(1460).build());
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  assert!(segs[0].th.f_syn && segs[0].th.f_ack);

  // the backlog is full now; the next SYN takes the reset path
  h.inject(SegBuilder::new(1001, 80).seq(1).syn().mss_opt(1460).build());
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  assert!(segs[0].th.f_rst);
}

#[test]
fn dropped_listener_resets_new_syns() {
  let mut h = Harness::new();
  let listener = h.tcp.listen(80).unwrap();
  drop(listener);
  h.inject(SegBuilder::new(1000, 80).seq(1).syn().mss_opt(1460).build());
  let segs = h.pump();
  assert_eq!(segs.len(), 1);
  assert!(segs[0].th.f_rst);
}

#[test]
fn connect_refused_by_rst() {
  let mut h = Harness::new();
  let mut fut = Box::pin(h.tcp.connect(h.peer_addr(), h.now));
  assert!(poll_once(&mut fut).is_pending());
  let segs = h.pump();
  let iss = segs[0].th.seq;
  let local_port = segs[0].th.src_port;

  h.inject(
    SegBuilder::new(PEER_PORT, local_port)
      .seq(0)
      .ack(iss.wrapping_add(1))
      .rst()
      .build(),
  );
  assert!(matches!(
    poll_once(&mut fut),
    Poll::Ready(Err(TcpError::Refused))
  ));
  assert_eq!(h.tcp.connection_count(), 0);
}

#[test]
fn rst_with_wrong_ack_in_syn_sent_is_ignored() {
  let mut h = Harness::new();
  let mut fut = Box::pin(h.tcp.connect(h.peer_addr(), h.now));
  assert!(poll_once(&mut fut).is_pending());
  let segs = h.pump();
  let iss = segs[0].th.seq;
  let local_port = segs[0].th.src_port;

  // RST with a stale ACK number must not kill the attempt
  h.inject(
    SegBuilder::new(PEER_PORT, local_port)
      .seq(0)
      .ack(iss.wrapping_sub(100))
      .rst()
      .build(),
  );
  assert!(poll_once(&mut fut).is_pending());
  assert_eq!(h.tcp.connection_count(), 1);
}
