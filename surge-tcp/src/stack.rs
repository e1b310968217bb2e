//! The TCP demultiplexer: routes incoming segments to TCBs or listeners,
//! answers stray segments with RST, selects ephemeral ports, and feeds the
//! per-shard packet pump.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::BytesMut;
use futures::channel::oneshot;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use surge_packet::checksum::Checksummer;
use surge_packet::tcp::{TcpHeader, TCP_HEADER_LEN};
use surge_packet::{OffloadInfo, Packet};

use crate::config::TcpConfig;
use crate::error::ListenError;
use crate::inet::{ConnId, HwFeatures, Inet, L4Packet, SocketAddress};
use crate::isn::{Isn, IsnGenerator};
use crate::socket::{Connection, ConnectFuture, ListenQueue, Listener};
use crate::tcb::{State, Tcb};
use crate::time::Instant;

/// Ephemeral port range used by `connect`.
const EPHEMERAL_PORTS: core::ops::RangeInclusive<u16> = 41952..=65535;

/// Egress state shared between the demultiplexer and its TCBs: the polling
/// set the pump drains, the stray-packet queue, and the defunct list through
/// which closed TCBs schedule their removal from the connection map.
pub(crate) struct Egress<I: Inet> {
  pub(crate) poll_tcbs: VecDeque<Rc<RefCell<Tcb<I>>>>,
  packetq: VecDeque<(I::Addr, Packet)>,
  /// Byte budget for packets that do not belong to any TCB.
  queue_space: usize,
  pub(crate) defunct: Vec<ConnId<I::Addr>>,
  hw: HwFeatures,
}

impl<I: Inet> Egress<I> {
  pub(crate) fn new(hw: HwFeatures, queue_space: usize) -> Egress<I> {
    Egress {
      poll_tcbs: VecDeque::new(),
      packetq: VecDeque::new(),
      queue_space,
      defunct: Vec::new(),
      hw,
    }
  }

  /// RFC 793 reset generation for a segment that reached no TCB, or hit an
  /// error inside one:
  ///   if ACK on:  <SEQ=SEG.ACK><CTL=RST>
  ///   if ACK off: <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
  pub(crate) fn respond_with_reset(
    &mut self,
    rth: &TcpHeader,
    local_ip: I::Addr,
    foreign_ip: I::Addr,
    seg_len: u32,
  ) {
    // never answer a RST with a RST
    if rth.f_rst {
      return;
    }
    let mut th = TcpHeader {
      src_port: rth.dst_port,
      dst_port: rth.src_port,
      data_offset: (TCP_HEADER_LEN / 4) as u8,
      f_rst: true,
      ..TcpHeader::default()
    };
    if rth.f_ack {
      th.seq = rth.ack;
    } else {
      th.seq = 0;
      th.ack = rth.seq.wrapping_add(seg_len);
      th.f_ack = true;
    }

    let mut hdr = BytesMut::zeroed(TCP_HEADER_LEN);
    th.build(&mut hdr);
    let mut oi = OffloadInfo {
      protocol: surge_packet::IP_PROTO_TCP,
      tcp_hdr_len: TCP_HEADER_LEN as u8,
      needs_csum: false,
    };
    let mut csum = Checksummer::new();
    I::pseudo_header_sum(&mut csum, local_ip, foreign_ip, TCP_HEADER_LEN);
    let checksum = if self.hw.tx_csum_l4_offload {
      oi.needs_csum = true;
      !csum.get()
    } else {
      csum.sum(&hdr);
      csum.get()
    };
    hdr[16..18].copy_from_slice(&checksum.to_be_bytes());
    let mut p = Packet::from_bytes(hdr.freeze());
    p.set_offload_info(oi);
    self.send_packet_without_tcb(foreign_ip, p);
  }

  /// Stray packets compete for a fixed byte budget and are dropped when it
  /// is exhausted.
  fn send_packet_without_tcb(&mut self, to: I::Addr, p: Packet) {
    if self.queue_space >= p.len() {
      self.queue_space -= p.len();
      self.packetq.push_back((to, p));
    }
  }
}

pub struct Tcp<I: Inet> {
  inet: I,
  cfg: TcpConfig,
  tcbs: HashMap<ConnId<I::Addr>, Rc<RefCell<Tcb<I>>>>,
  listening: HashMap<u16, Rc<RefCell<ListenQueue<I>>>>,
  egress: Rc<RefCell<Egress<I>>>,
  isn: Box<dyn Isn<I::Addr>>,
  rng: StdRng,
  tcb_polled: u32,
}

impl<I: Inet> Tcp<I> {
  pub fn new(inet: I) -> Tcp<I> {
    Tcp::with_config(inet, TcpConfig::default())
  }

  pub fn with_config(inet: I, cfg: TcpConfig) -> Tcp<I> {
    let hw = inet.hw_features();
    let queue_space = cfg.user_queue_space;
    Tcp {
      inet,
      cfg,
      tcbs: HashMap::new(),
      listening: HashMap::new(),
      egress: Rc::new(RefCell::new(Egress::new(hw, queue_space))),
      isn: Box::new(IsnGenerator::new()),
      rng: StdRng::from_entropy(),
      tcb_polled: 0,
    }
  }

  pub fn inet(&self) -> &I {
    &self.inet
  }

  /// Open a listening port. `accept` on the returned handle resolves as
  /// peers connect, in FIFO order, up to the configured backlog.
  pub fn listen(&mut self, port: u16) -> Result<Listener<I>, ListenError> {
    let backlog = self.cfg.listen_backlog;
    self.listen_with_backlog(port, backlog)
  }

  pub fn listen_with_backlog(
    &mut self,
    port: u16,
    backlog: usize,
  ) -> Result<Listener<I>, ListenError> {
    if let Some(existing) = self.listening.get(&port) {
      if existing.borrow().open {
        return Err(ListenError::PortInUse(port));
      }
    }
    let q = Rc::new(RefCell::new(ListenQueue::new(port, backlog)));
    self.listening.insert(port, q.clone());
    Ok(Listener::new(q))
  }

  /// Active open. The returned future resolves once the connection is
  /// established, or fails with a connect error, refusal or reset.
  pub fn connect(&mut self, sa: SocketAddress<I::Addr>, now: Instant) -> ConnectFuture<I> {
    let src_ip = self.inet.host_address();
    let id = loop {
      let src_port = self.rng.gen_range(EPHEMERAL_PORTS);
      let id = ConnId {
        local_ip: src_ip,
        foreign_ip: sa.addr,
        local_port: src_port,
        foreign_port: sa.port,
      };
      // the tuple must be free and its hash must steer to this shard
      if !self.tcbs.contains_key(&id) && self.inet.steers_to_shard(id.hash64()) {
        break id;
      }
    };

    let tcbp = self.create_tcb(id, now);
    self.tcbs.insert(id, tcbp.clone());
    let (tx, rx) = oneshot::channel();
    {
      let mut tcb = tcbp.borrow_mut();
      tcb.set_connect_done(tx);
      let iss = self.isn.get(&id, now);
      tcb.connect(iss, now);
    }
    ConnectFuture::new(tcbp, rx)
  }

  fn create_tcb(&mut self, id: ConnId<I::Addr>, now: Instant) -> Rc<RefCell<Tcb<I>>> {
    let cfg = self.cfg.clone();
    let hw = self.inet.hw_features();
    let egress = self.egress.clone();
    Rc::new_cyclic(|me| RefCell::new(Tcb::new(id, cfg, hw, egress, me.clone(), now)))
  }

  /// Ingress entry: a TCP segment delivered by the IP layer.
  pub fn received(&mut self, mut p: Packet, from: I::Addr, to: I::Addr, now: Instant) {
    if p.len() < TCP_HEADER_LEN {
      return;
    }
    let th = match TcpHeader::parse(p.linearize()) {
      Ok(th) => th,
      Err(()) => return,
    };
    if th.header_len() > p.len() {
      return;
    }

    if !self.inet.hw_features().rx_csum_offload {
      let mut csum = Checksummer::new();
      I::pseudo_header_sum(&mut csum, from, to, p.len());
      for frag in p.fragments() {
        csum.sum(frag);
      }
      if csum.get() != 0 {
        log::log!(
          log::Level::Trace,
          "tcp: dropping segment from {} with bad checksum",
          from
        );
        return;
      }
    }

    let opts = p.linearize()[TCP_HEADER_LEN..th.header_len()].to_vec();
    p.trim_front(th.header_len());

    let id = ConnId {
      local_ip: to,
      foreign_ip: from,
      local_port: th.dst_port,
      foreign_port: th.src_port,
    };

    if let Some(tcbp) = self.tcbs.get(&id).cloned() {
      let state = tcbp.borrow().state();
      if state == State::SynSent {
        tcbp.borrow_mut().input_handle_syn_sent_state(&th, &opts, now);
      } else {
        tcbp.borrow_mut().input_handle_other_state(&th, p, now);
      }
      self.reap_defunct();
      return;
    }

    let seg_len = p.len() as u32 + th.f_syn as u32 + th.f_fin as u32;
    let listener = self
      .listening
      .get(&id.local_port)
      .filter(|l| {
        let l = l.borrow();
        l.open && l.q.len() < l.backlog
      })
      .cloned();

    let Some(listener) = listener else {
      // No TCB, and no listener able to take the segment: everything is
      // discarded and anything but a RST provokes a RST in response.
      return self
        .egress
        .borrow_mut()
        .respond_with_reset(&th, to, from, seg_len);
    };

    // LISTEN state processing, RFC 793 style:
    // first check for a RST: ignore it
    if th.f_rst {
      return;
    }
    // second check for an ACK: bad on a listening port, <SEQ=SEG.ACK><CTL=RST>
    if th.f_ack {
      return self
        .egress
        .borrow_mut()
        .respond_with_reset(&th, to, from, seg_len);
    }
    // third check for a SYN: create the connection
    if th.f_syn {
      let tcbp = self.create_tcb(id, now);
      self.tcbs.insert(id, tcbp.clone());
      listener.borrow_mut().push(Connection::new(tcbp.clone()));
      let iss = self.isn.get(&id, now);
      tcbp
        .borrow_mut()
        .input_handle_listen_state(&th, &opts, iss, now);
      return;
    }
    // fourth, other text or control: drop
  }

  /// One pull by the packet pump. Stray packets are served when no TCB is
  /// waiting, plus one fairness slot every 128 TCB polls.
  pub fn poll_packet(&mut self, now: Instant) -> Option<L4Packet<I::Addr>> {
    let stray = {
      let mut eg = self.egress.borrow_mut();
      if self.tcb_polled % 128 == 0 || eg.poll_tcbs.is_empty() {
        let popped = eg.packetq.pop_front();
        if let Some((_, p)) = &popped {
          // hand the byte credit back as the packet leaves the queue
          eg.queue_space += p.len();
        }
        popped
      } else {
        None
      }
    };

    let mut l4p = stray;
    if l4p.is_none() {
      loop {
        let tcbp = self.egress.borrow_mut().poll_tcbs.pop_front();
        let Some(tcbp) = tcbp else { break };
        self.tcb_polled = self.tcb_polled.wrapping_add(1);
        let got = tcbp.borrow_mut().get_packet(now);
        if let Some(x) = got {
          l4p = Some(x);
          break;
        }
      }
    }

    self.reap_defunct();
    l4p.map(|(to, p)| {
      let e_dst = self.inet.l2_dst_address(to);
      L4Packet { to, p, e_dst }
    })
  }

  /// Fire every expired connection timer. The pump calls this whenever the
  /// deadline from `poll_at` has passed.
  pub fn on_timers(&mut self, now: Instant) {
    let tcbs: Vec<_> = self.tcbs.values().cloned().collect();
    for tcbp in tcbs {
      tcbp.borrow_mut().on_timers(now);
    }
    self.reap_defunct();
  }

  /// Earliest timer deadline across all connections.
  pub fn poll_at(&self) -> Option<Instant> {
    self.tcbs.values().filter_map(|t| t.borrow().poll_at()).min()
  }

  /// Whether the pump has packets to pull right now.
  pub fn has_egress(&self) -> bool {
    let eg = self.egress.borrow();
    !eg.packetq.is_empty() || !eg.poll_tcbs.is_empty()
  }

  pub fn connection_count(&self) -> usize {
    self.tcbs.len()
  }

  /// Closed TCBs schedule themselves here for removal from the map; see the
  /// TCB cleanup path. Running this at every dispatch point keeps CLOSED
  /// TCBs unreachable within the same cooperative step.
  fn reap_defunct(&mut self) {
    let ids = std::mem::take(&mut self.egress.borrow_mut().defunct);
    for id in ids {
      if let Some(tcbp) = self.tcbs.get(&id) {
        if tcbp.borrow().state() == State::Closed {
          self.tcbs.remove(&id);
        }
      }
    }
  }
}
