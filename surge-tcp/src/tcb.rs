//! The transmission control block: the per-connection protocol engine.
//!
//! Relevant material:
//! RFC 793 (connection machine, segment processing order),
//! RFC 1122 (delayed ACK, persist back-off),
//! RFC 5681 (congestion control, fast retransmit/recovery),
//! RFC 6582 (NewReno partial ACKs), RFC 3042 (limited transmit),
//! RFC 6298 (retransmission timer).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::task::Waker;

use bytes::BytesMut;
use futures::channel::oneshot;
use surge_packet::checksum::Checksummer;
use surge_packet::tcp::{TcpHeader, TcpOption, TCP_HEADER_LEN};
use surge_packet::{OffloadInfo, Packet};

use crate::config::TcpConfig;
use crate::error::TcpError;
use crate::inet::{ConnId, HwFeatures, Inet};
use crate::reassembler::PacketMerger;
use crate::rto::RtoEstimator;
use crate::seq::TcpSeqNumber;
use crate::stack::Egress;
use crate::time::{Duration, Instant, Timer};

const MAX_NR_RETRANSMIT: u16 = 5;
const PERSIST_MAX: Duration = Duration::from_secs(60);
/// Linux's default receive window, scaled up by the local window shift.
const DEFAULT_RCV_WINDOW: u32 = 29200;
const LOCAL_WINDOW_SCALE: u8 = 7;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum State {
  Closed,
  Listen,
  SynSent,
  SynReceived,
  Established,
  FinWait1,
  FinWait2,
  CloseWait,
  Closing,
  LastAck,
  TimeWait,
}

impl core::fmt::Display for State {
  fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
    match *self {
      State::Closed => write!(f, "CLOSED"),
      State::Listen => write!(f, "LISTEN"),
      State::SynSent => write!(f, "SYN-SENT"),
      State::SynReceived => write!(f, "SYN-RECEIVED"),
      State::Established => write!(f, "ESTABLISHED"),
      State::FinWait1 => write!(f, "FIN-WAIT-1"),
      State::FinWait2 => write!(f, "FIN-WAIT-2"),
      State::CloseWait => write!(f, "CLOSE-WAIT"),
      State::Closing => write!(f, "CLOSING"),
      State::LastAck => write!(f, "LAST-ACK"),
      State::TimeWait => write!(f, "TIME-WAIT"),
    }
  }
}

/// Option negotiation state, filled from SYN segments.
#[derive(Debug)]
pub(crate) struct OptionState {
  mss_received: bool,
  win_scale_received: bool,
  remote_mss: u16,
  local_mss: u16,
  remote_win_scale: u8,
  local_win_scale: u8,
}

impl Default for OptionState {
  fn default() -> OptionState {
    OptionState {
      mss_received: false,
      win_scale_received: false,
      // RFC 879 default for peers that do not send an MSS option
      remote_mss: 536,
      local_mss: 536,
      remote_win_scale: 0,
      local_win_scale: 0,
    }
  }
}

impl OptionState {
  pub(crate) fn parse(&mut self, mut opts: &[u8]) {
    while !opts.is_empty() {
      match TcpOption::parse(opts) {
        Ok((rest, option)) => {
          match option {
            TcpOption::EndOfList => return,
            TcpOption::NoOperation => {}
            TcpOption::MaxSegmentSize(mss) => {
              self.mss_received = true;
              self.remote_mss = mss;
            }
            TcpOption::WindowScale(shift) => {
              self.win_scale_received = true;
              self.remote_win_scale = shift;
            }
            TcpOption::Unknown { .. } => {}
          }
          opts = rest;
        }
        // A malformed length terminates option parsing.
        Err(()) => return,
      }
    }
  }

  fn emit_size(&self, syn_on: bool, ack_on: bool) -> usize {
    if !syn_on {
      return 0;
    }
    let mut size = 4; // MSS
    if !ack_on || self.win_scale_received {
      size += 3; // window scale, echoed on SYN|ACK only when offered
    }
    // NOP padding to a 4 byte multiple
    (size + 3) & !3
  }

  fn emit(&self, mut buffer: &mut [u8], syn_on: bool, ack_on: bool) {
    if !syn_on {
      return;
    }
    buffer = TcpOption::MaxSegmentSize(self.local_mss).build(buffer);
    if !ack_on || self.win_scale_received {
      buffer = TcpOption::WindowScale(self.local_win_scale).build(buffer);
    }
    for b in buffer.iter_mut() {
      *b = 0x01; // NOP
    }
  }
}

/// A transmitted segment awaiting acknowledgment.
#[derive(Debug)]
pub(crate) struct UnackedSegment {
  p: Packet,
  data_len: u32,
  /// May shrink below `data_len` after a partial ACK; the packet body is
  /// deliberately not trimmed so retransmission reuses it as-is.
  data_remaining: u32,
  nr_transmits: u16,
  tx_time: Instant,
}

#[derive(Debug)]
pub(crate) struct SendState {
  pub(crate) unacknowledged: TcpSeqNumber,
  pub(crate) next: TcpSeqNumber,
  pub(crate) window: u32,
  pub(crate) window_scale: u8,
  pub(crate) mss: u16,
  pub(crate) wl1: TcpSeqNumber,
  pub(crate) wl2: TcpSeqNumber,
  pub(crate) initial: TcpSeqNumber,
  pub(crate) data: VecDeque<UnackedSegment>,
  unsent: VecDeque<Packet>,
  pub(crate) unsent_len: u32,
  pub(crate) queued_len: u32,
  closed: bool,
  /// Remaining user-queue credit; `send` futures wait on this.
  user_queue_space: usize,
  space_waiters: VecDeque<Waker>,
  all_data_acked_waker: Option<Waker>,
  pub(crate) cwnd: u32,
  pub(crate) ssthresh: u32,
  pub(crate) dupacks: u16,
  syn_retransmit: u16,
  fin_retransmit: u16,
  pub(crate) limited_transfer: u32,
  partial_ack: u32,
  pub(crate) recover: TcpSeqNumber,
  window_probe: bool,
  syn_tx_time: Instant,
}

impl Default for SendState {
  fn default() -> SendState {
    SendState {
      unacknowledged: TcpSeqNumber::default(),
      next: TcpSeqNumber::default(),
      window: 0,
      window_scale: 0,
      mss: 536,
      wl1: TcpSeqNumber::default(),
      wl2: TcpSeqNumber::default(),
      initial: TcpSeqNumber::default(),
      data: VecDeque::new(),
      unsent: VecDeque::new(),
      unsent_len: 0,
      queued_len: 0,
      closed: false,
      user_queue_space: 0,
      space_waiters: VecDeque::new(),
      all_data_acked_waker: None,
      cwnd: 0,
      ssthresh: u32::MAX,
      dupacks: 0,
      syn_retransmit: 0,
      fin_retransmit: 0,
      limited_transfer: 0,
      partial_ack: 0,
      recover: TcpSeqNumber::default(),
      window_probe: false,
      syn_tx_time: Instant::ZERO,
    }
  }
}

#[derive(Debug, Default)]
pub(crate) struct ReceiveState {
  pub(crate) next: TcpSeqNumber,
  pub(crate) window: u32,
  pub(crate) window_scale: u8,
  pub(crate) mss: u16,
  pub(crate) initial: TcpSeqNumber,
  data: VecDeque<Packet>,
  pub(crate) out_of_order: PacketMerger,
  data_waker: Option<Waker>,
}

pub(crate) struct Tcb<I: Inet> {
  state: State,
  local_ip: I::Addr,
  foreign_ip: I::Addr,
  local_port: u16,
  foreign_port: u16,
  me: Weak<RefCell<Tcb<I>>>,
  egress: Rc<RefCell<Egress<I>>>,
  cfg: TcpConfig,
  hw: HwFeatures,
  connect_done: Option<oneshot::Sender<Result<(), TcpError>>>,
  pub(crate) snd: SendState,
  pub(crate) rcv: ReceiveState,
  opts: OptionState,
  pub(crate) rto: RtoEstimator,
  persist_timeout: Duration,
  retransmit: Timer,
  persist: Timer,
  delayed_ack: Timer,
  time_wait: Timer,
  nr_full_seg_received: u16,
  packetq: VecDeque<Packet>,
  poll_active: bool,
  close_pending: bool,
  error: Option<TcpError>,
  /// Time of the last stack entry; app-side calls reuse it, which is exact
  /// enough under cooperative scheduling.
  now: Instant,
}

impl<I: Inet> Tcb<I> {
  pub(crate) fn new(
    id: ConnId<I::Addr>,
    cfg: TcpConfig,
    hw: HwFeatures,
    egress: Rc<RefCell<Egress<I>>>,
    me: Weak<RefCell<Tcb<I>>>,
    now: Instant,
  ) -> Tcb<I> {
    let user_queue_space = cfg.user_queue_space;
    Tcb {
      state: State::Closed,
      local_ip: id.local_ip,
      foreign_ip: id.foreign_ip,
      local_port: id.local_port,
      foreign_port: id.foreign_port,
      me,
      egress,
      cfg,
      hw,
      connect_done: None,
      snd: SendState {
        user_queue_space,
        ..SendState::default()
      },
      rcv: ReceiveState::default(),
      opts: OptionState::default(),
      rto: RtoEstimator::default(),
      persist_timeout: Duration::from_millis(1000),
      retransmit: Timer::new(),
      persist: Timer::new(),
      delayed_ack: Timer::new(),
      time_wait: Timer::new(),
      nr_full_seg_received: 0,
      packetq: VecDeque::new(),
      poll_active: false,
      close_pending: false,
      error: None,
      now,
    }
  }

  pub(crate) fn state(&self) -> State {
    self.state
  }

  pub(crate) fn error(&self) -> Option<TcpError> {
    self.error
  }

  pub(crate) fn conn_id(&self) -> ConnId<I::Addr> {
    ConnId {
      local_ip: self.local_ip,
      foreign_ip: self.foreign_ip,
      local_port: self.local_port,
      foreign_port: self.foreign_port,
    }
  }

  pub(crate) fn set_connect_done(&mut self, tx: oneshot::Sender<Result<(), TcpError>>) {
    self.connect_done = Some(tx);
  }

  fn trace(&self, event: core::fmt::Arguments) {
    log::log!(
      log::Level::Trace,
      "tcp {}:{} <-> {}:{} [{}]: {}",
      self.local_ip,
      self.local_port,
      self.foreign_ip,
      self.foreign_port,
      self.state,
      event
    );
  }

  // ==== connection setup ====================================================

  pub(crate) fn connect(&mut self, iss: TcpSeqNumber, now: Instant) {
    self.now = now;
    // An initial send sequence number is selected and a <SEQ=ISS><CTL=SYN>
    // segment is sent. SND.UNA is ISS, SND.NXT is ISS+1; enter SYN-SENT.
    self.do_setup_isn(iss);
    self.opts.local_win_scale = LOCAL_WINDOW_SCALE;
    self.rcv.window_scale = LOCAL_WINDOW_SCALE;
    self.opts.local_mss = self.local_mss();
    self.rcv.mss = self.opts.local_mss;
    self.rcv.window = DEFAULT_RCV_WINDOW << self.rcv.window_scale;
    self.do_syn_sent();
  }

  fn do_setup_isn(&mut self, iss: TcpSeqNumber) {
    self.snd.initial = iss;
    self.snd.unacknowledged = iss;
    self.snd.next = iss + 1u32;
    self.snd.recover = iss;
  }

  fn do_syn_sent(&mut self) {
    self.state = State::SynSent;
    self.snd.syn_tx_time = self.now;
    self.output();
  }

  fn do_syn_received(&mut self) {
    self.state = State::SynReceived;
    self.snd.syn_tx_time = self.now;
    self.output();
  }

  fn do_established(&mut self) {
    self.state = State::Established;
    // The SYN consumed one sequence number.
    if self.snd.unacknowledged == self.snd.initial {
      self.snd.unacknowledged = self.snd.initial + 1u32;
    }
    self.update_rto(self.snd.syn_tx_time);
    if let Some(done) = self.connect_done.take() {
      let _ = done.send(Ok(()));
    }
  }

  fn do_local_fin_acked(&mut self) {
    self.snd.unacknowledged += 1u32;
    self.snd.next += 1u32;
  }

  fn do_time_wait(&mut self) {
    self.state = State::TimeWait;
    self.retransmit.cancel();
    self.persist.cancel();
    self.delayed_ack.cancel();
    self.time_wait.rearm(self.now + self.cfg.time_wait_timeout);
    self.signal_data_received();
  }

  fn do_closed(&mut self) {
    self.state = State::Closed;
    self.cleanup();
    self.signal_data_received();
    self.wake_senders();
  }

  fn do_reset(&mut self) {
    self.fail(TcpError::Reset);
  }

  /// Terminal teardown: complete every pending application future with
  /// `err`, then delete the TCB.
  fn fail(&mut self, err: TcpError) {
    self.trace(format_args!("terminal error: {}", err));
    let err = *self.error.get_or_insert(err);
    self.state = State::Closed;
    if let Some(done) = self.connect_done.take() {
      let _ = done.send(Err(err));
    }
    self.cleanup();
    self.signal_data_received();
    self.wake_senders();
    if let Some(w) = self.snd.all_data_acked_waker.take() {
      w.wake();
    }
  }

  fn cleanup(&mut self) {
    self.snd.unsent.clear();
    self.snd.unsent_len = 0;
    self.snd.data.clear();
    self.rcv.out_of_order.clear();
    self.rcv.data.clear();
    self.retransmit.cancel();
    self.persist.cancel();
    self.delayed_ack.cancel();
    self.time_wait.cancel();
    self.remove_from_tcbs();
  }

  fn remove_from_tcbs(&mut self) {
    self.egress.borrow_mut().defunct.push(self.conn_id());
  }

  fn local_mss(&self) -> u16 {
    self.hw.mtu - TCP_HEADER_LEN as u16 - I::IP_HDR_LEN_MIN as u16
  }

  fn init_from_options(&mut self, th: &TcpHeader, opts: &[u8]) {
    self.opts.parse(opts);
    if !self.opts.win_scale_received {
      // The peer does not scale; neither direction does.
      self.opts.remote_win_scale = 0;
      self.opts.local_win_scale = 0;
    } else if self.opts.local_win_scale == 0 {
      // Passive open: echo our shift now that the peer offered one.
      self.opts.local_win_scale = LOCAL_WINDOW_SCALE;
    }

    self.snd.window_scale = self.opts.remote_win_scale;
    self.rcv.window_scale = self.opts.local_win_scale;

    self.snd.mss = self.opts.remote_mss;
    self.opts.local_mss = self.local_mss();
    self.rcv.mss = self.opts.local_mss;

    self.rcv.window = DEFAULT_RCV_WINDOW << self.rcv.window_scale;
    self.snd.window = (th.window as u32) << self.snd.window_scale;

    // Segment sequence and ack numbers used for the last window update
    self.snd.wl1 = TcpSeqNumber(th.seq);
    self.snd.wl2 = TcpSeqNumber(th.ack);

    // Initial congestion window per RFC 5681
    let mss = self.snd.mss as u32;
    self.snd.cwnd = if mss > 2190 {
      2 * mss
    } else if mss > 1095 {
      3 * mss
    } else {
      4 * mss
    };
    self.snd.ssthresh = (th.window as u32) << self.snd.window_scale;
  }

  // ==== input: LISTEN and SYN-SENT ==========================================

  pub(crate) fn input_handle_listen_state(
    &mut self,
    th: &TcpHeader,
    opts: &[u8],
    iss: TcpSeqNumber,
    now: Instant,
  ) {
    self.now = now;
    let seg_seq = TcpSeqNumber(th.seq);

    // RCV.NXT is SEG.SEQ+1, IRS is SEG.SEQ
    self.rcv.next = seg_seq + 1u32;
    self.rcv.initial = seg_seq;

    // Select an ISS and answer <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>. SND.NXT
    // is ISS+1 up front so a retransmitted SYN|ACK keeps its sequence.
    self.do_setup_isn(iss);

    self.trace(format_args!("LISTEN -> SYN_RECEIVED"));
    self.init_from_options(th, opts);
    self.do_syn_received();
  }

  pub(crate) fn input_handle_syn_sent_state(
    &mut self,
    th: &TcpHeader,
    opts: &[u8],
    now: Instant,
  ) {
    self.now = now;
    let seg_seq = TcpSeqNumber(th.seq);
    let seg_ack = TcpSeqNumber(th.ack);

    let mut acceptable = false;
    // first check the ACK bit
    if th.f_ack {
      // SEG.ACK =< ISS or SEG.ACK > SND.NXT: send a reset (unless the RST
      // bit is set) and drop
      if seg_ack <= self.snd.initial || seg_ack > self.snd.next {
        return self.respond_with_reset(th);
      }
      // SND.UNA =< SEG.ACK =< SND.NXT makes the ACK acceptable
      acceptable = self.snd.unacknowledged <= seg_ack && seg_ack <= self.snd.next;
    }

    // second check the RST bit
    if th.f_rst {
      // With an acceptable ACK the user is told the connection was refused;
      // either way the segment is dropped.
      if acceptable {
        if let Some(done) = self.connect_done.take() {
          let _ = done.send(Err(TcpError::Refused));
        }
        self.fail(TcpError::Refused);
      }
      return;
    }

    // fourth check the SYN bit
    if th.f_syn {
      self.rcv.next = seg_seq + 1u32;
      self.rcv.initial = seg_seq;
      if th.f_ack {
        self.snd.unacknowledged = seg_ack;
      }
      if self.snd.unacknowledged > self.snd.initial {
        // Our SYN has been ACKed: ESTABLISHED, answer <CTL=ACK>
        self.trace(format_args!("SYN_SENT -> ESTABLISHED"));
        self.init_from_options(th, opts);
        self.do_established();
        self.output();
      } else {
        // Simultaneous open would land here; not supported, answer SYN|ACK
        self.trace(format_args!("SYN_SENT -> SYN_RECEIVED"));
        self.do_syn_received();
      }
    }

    // neither SYN nor RST: drop
  }

  // ==== input: synchronized states ==========================================

  pub(crate) fn input_handle_other_state(&mut self, th: &TcpHeader, mut p: Packet, now: Instant) {
    self.now = now;
    let mut do_output = false;
    let mut do_output_data = false;
    let mut seg_seq = TcpSeqNumber(th.seq);
    let seg_ack = TcpSeqNumber(th.ack);
    let mut seg_len = p.len() as u32;

    // first check the sequence number
    if !self.segment_acceptable(seg_seq, seg_len) {
      // A retransmitted FIN in TIME-WAIT lands here (its sequence is below
      // RCV.NXT): restart the 2*MSL timer along with the ACK below.
      if self.state == State::TimeWait && th.f_fin {
        self.time_wait.rearm(self.now + self.cfg.time_wait_timeout);
      }
      // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
      return self.output();
    }

    // drop the duplicate prefix of the segment
    if seg_seq < self.rcv.next {
      let dup = core::cmp::min(self.rcv.next - seg_seq, seg_len as usize);
      p.trim_front(dup);
      seg_len -= dup as u32;
      seg_seq += dup;
    }
    // and anything past the right edge of the receive window
    let window_end = self.rcv.next + self.rcv.window;
    if seg_len > 0 && seg_seq + seg_len as usize > window_end {
      let excess = (seg_seq + seg_len as usize) - window_end;
      p.truncate(p.len() - excess);
      seg_len -= excess as u32;
    }

    if seg_seq != self.rcv.next {
      self.insert_out_of_order(seg_seq, p);
      // A receiver SHOULD send an immediate duplicate ACK when an
      // out-of-order segment arrives.
      return self.output();
    }

    // second check the RST bit
    if th.f_rst {
      if self.state == State::SynReceived {
        // Passive opens return to LISTEN silently (the TCB is simply
        // deleted here); an active open is told "connection refused".
        if let Some(done) = self.connect_done.take() {
          let _ = done.send(Err(TcpError::Refused));
          return self.fail(TcpError::Refused);
        }
        return self.do_reset();
      }
      if matches!(
        self.state,
        State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait
      ) {
        // Pending RECEIVEs and SENDs get "reset" responses; flush segment
        // queues, enter CLOSED, delete the TCB.
        return self.do_reset();
      }
      if matches!(self.state, State::Closing | State::LastAck | State::TimeWait) {
        return self.do_closed();
      }
    }

    // fourth check the SYN bit: a SYN in the window is an error
    if th.f_syn {
      self.respond_with_reset(th);
      return self.do_reset();
    }

    // fifth check the ACK field: off means drop
    if !th.f_ack {
      return;
    }

    if self.state == State::SynReceived {
      // SND.UNA =< SEG.ACK =< SND.NXT: enter ESTABLISHED and continue
      if self.snd.unacknowledged <= seg_ack && seg_ack <= self.snd.next {
        self.trace(format_args!("SYN_RECEIVED -> ESTABLISHED"));
        self.do_established();
      } else {
        // <SEQ=SEG.ACK><CTL=RST>
        return self.respond_with_reset(th);
      }
    }

    if matches!(self.state, State::Established | State::CloseWait) {
      if self.snd.unacknowledged < seg_ack && seg_ack <= self.snd.next {
        // The remote ACKed data we sent
        let acked_bytes = self.data_segment_acked(seg_ack);

        // SND.UNA < SEG.ACK =< SND.NXT: consider a send window update
        if self.snd.wl1 < seg_seq || (self.snd.wl1 == seg_seq && self.snd.wl2 <= seg_ack) {
          self.update_window(th.window, seg_seq, seg_ack);
        }

        // some data is acked, try to send more
        do_output_data = true;

        if self.snd.dupacks >= 3 {
          // We are in fast retransmit / fast recovery
          let smss = self.snd.mss as u32;
          if seg_ack > self.snd.recover {
            self.trace(format_args!("fast recovery: full ack"));
            // cwnd = min(ssthresh, max(FlightSize, SMSS) + SMSS)
            self.snd.cwnd = core::cmp::min(
              self.snd.ssthresh,
              core::cmp::max(self.flight_size(), smss) + smss,
            );
            self.exit_fast_recovery();
            self.set_retransmit_timer_after_ack();
          } else {
            self.trace(format_args!("fast recovery: partial ack"));
            // Retransmit the first unacknowledged segment and deflate the
            // congestion window by the amount of new data acknowledged
            self.fast_retransmit();
            self.snd.cwnd = self.snd.cwnd.saturating_sub(acked_bytes);
            // a partial ACK of at least SMSS adds back SMSS
            if acked_bytes >= smss {
              self.snd.cwnd += smss;
            }
            // The first partial ACK during fast recovery also resets the
            // retransmit timer; fast recovery is not exited.
            self.snd.partial_ack += 1;
            if self.snd.partial_ack == 1 {
              self.start_retransmit_timer();
            }
          }
        } else {
          // This ACK moves SND.UNA, so it is not a duplicate: leave fast
          // recovery accounting and reset the retransmit timer.
          self.exit_fast_recovery();
          self.set_retransmit_timer_after_ack();
        }
      } else if !self.snd.data.is_empty()
        && seg_len == 0
        && !th.f_fin
        && !th.f_syn
        && seg_ack == self.snd.unacknowledged
        && ((th.window as u32) << self.snd.window_scale) == self.snd.window
      {
        // RFC 5681: use incoming duplicate ACKs to detect and repair loss.
        self.snd.dupacks += 1;
        let smss = self.snd.mss as u32;
        self.trace(format_args!("duplicate ack nr {}", self.snd.dupacks));
        if self.snd.dupacks == 1 || self.snd.dupacks == 2 {
          // RFC 3042 limited transmit: cwnd + 2*SMSS may be in flight
          do_output_data = true;
        } else if self.snd.dupacks == 3 {
          // RFC 6582: only enter fast retransmit if the ACK covers more
          // than `recover`
          if seg_ack - 1u32 > self.snd.recover {
            self.snd.recover = self.snd.next - 1u32;
            self.snd.ssthresh = core::cmp::max(
              self.flight_size().saturating_sub(self.snd.limited_transfer) / 2,
              2 * smss,
            );
            self.fast_retransmit();
          }
          self.snd.cwnd = self.snd.ssthresh + 3 * smss;
        } else if self.snd.dupacks > 3 {
          self.snd.cwnd += smss;
          do_output_data = true;
        }
      } else if seg_ack > self.snd.next {
        // An ACK of something not yet sent: <ACK>, drop the segment
        return self.output();
      } else if self.snd.window == 0 && th.window > 0 {
        self.update_window(th.window, seg_seq, seg_ack);
        do_output_data = true;
      }
    }

    if self.state == State::FinWait1 {
      // if our FIN is now acknowledged, enter FIN-WAIT-2
      if seg_ack == self.snd.next + 1u32 {
        self.trace(format_args!("FIN_WAIT_1 -> FIN_WAIT_2"));
        self.state = State::FinWait2;
        self.do_local_fin_acked();
        if self.snd.data.is_empty() {
          self.stop_retransmit_timer();
        }
      }
    }

    if self.state == State::Closing {
      if seg_ack == self.snd.next + 1u32 {
        self.trace(format_args!("CLOSING -> TIME_WAIT"));
        self.do_local_fin_acked();
        return self.do_time_wait();
      } else {
        return;
      }
    }

    if self.state == State::LastAck {
      if seg_ack == self.snd.next + 1u32 {
        self.trace(format_args!("LAST_ACK -> CLOSED"));
        self.do_local_fin_acked();
        return self.do_closed();
      }
    }

    // seventh, process the segment text
    if matches!(
      self.state,
      State::Established | State::FinWait1 | State::FinWait2
    ) {
      if !p.is_empty() {
        // RCV.NXT advances over the data accepted
        self.rcv.data.push_back(p);
        self.rcv.next += seg_len as usize;
        let merged = self.merge_out_of_order();
        self.signal_data_received();
        if merged {
          // a segment filling a gap forces an immediate ACK
          do_output = true;
        } else {
          do_output = self.should_send_ack(seg_len);
        }
      }
    } else if matches!(
      self.state,
      State::CloseWait | State::Closing | State::LastAck | State::TimeWait
    ) {
      // A FIN has already been received from the remote side; ignore text.
      return;
    }

    // eighth, check the FIN bit
    if th.f_fin {
      let fin_seq = seg_seq + seg_len as usize;
      if fin_seq == self.rcv.next {
        self.rcv.next = fin_seq + 1u32;
        self.signal_data_received();

        // ACK data and FIN together; cancel any delayed ACK.
        self.clear_delayed_ack();
        do_output = false;
        self.output();

        match self.state {
          State::SynReceived | State::Established => {
            self.trace(format_args!("-> CLOSE_WAIT"));
            self.state = State::CloseWait;
          }
          State::FinWait1 => {
            // had our FIN been ACKed we would already be in FIN-WAIT-2
            self.trace(format_args!("FIN_WAIT_1 -> CLOSING"));
            self.state = State::Closing;
          }
          State::FinWait2 => {
            self.trace(format_args!("FIN_WAIT_2 -> TIME_WAIT"));
            return self.do_time_wait();
          }
          State::TimeWait => {
            // a retransmitted FIN restarts the 2*MSL timer
            self.time_wait.rearm(self.now + self.cfg.time_wait_timeout);
          }
          _ => {}
        }
      }
    }

    if do_output || (do_output_data && self.can_send() > 0) {
      // output will carry the ACK; drop any scheduled delayed ACK
      self.clear_delayed_ack();
      self.output();
    }
  }

  // ==== acceptability and ACK bookkeeping ===================================

  /// RFC 793 section 3.3 segment acceptability.
  pub(crate) fn segment_acceptable(&self, seg_seq: TcpSeqNumber, seg_len: u32) -> bool {
    if seg_len == 0 && self.rcv.window == 0 {
      // SEG.SEQ = RCV.NXT
      seg_seq == self.rcv.next
    } else if seg_len == 0 && self.rcv.window > 0 {
      // RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
      self.rcv.next <= seg_seq && seg_seq < self.rcv.next + self.rcv.window
    } else if seg_len > 0 && self.rcv.window > 0 {
      // RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
      //   or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
      let window_end = self.rcv.next + self.rcv.window;
      let seg_end = seg_seq + (seg_len - 1) as usize;
      (self.rcv.next <= seg_seq && seg_seq < window_end)
        || (self.rcv.next <= seg_end && seg_end < window_end)
    } else {
      // SEG.LEN > 0 with RCV.WND = 0 is not acceptable
      false
    }
  }

  /// Release unacked segments covered by `seg_ack`. Returns the number of
  /// newly acknowledged bytes.
  fn data_segment_acked(&mut self, seg_ack: TcpSeqNumber) -> u32 {
    let mut total_acked_bytes = 0;
    // full ACK of leading segments
    while let Some(front) = self.snd.data.front() {
      if self.snd.unacknowledged + front.data_remaining as usize > seg_ack {
        break;
      }
      let front = self.snd.data.pop_front().unwrap();
      self.snd.unacknowledged += front.data_remaining as usize;
      // Karn: never sample retransmitted segments
      if front.nr_transmits == 0 {
        self.update_rto(front.tx_time);
      }
      self.update_cwnd(front.data_remaining);
      total_acked_bytes += front.data_remaining;
      self.release_queue_space(front.data_len as usize);
    }
    // partial ACK of the front segment. The packet body is not trimmed, so
    // a retransmission does not need to rebuild the header.
    if self.snd.unacknowledged < seg_ack {
      if let Some(front) = self.snd.data.front_mut() {
        let acked_bytes = (seg_ack - self.snd.unacknowledged) as u32;
        front.data_remaining -= acked_bytes;
        self.snd.unacknowledged = seg_ack;
        self.update_cwnd(acked_bytes);
        total_acked_bytes += acked_bytes;
      } else {
        self.snd.unacknowledged = seg_ack;
      }
    }
    total_acked_bytes
  }

  fn update_window(&mut self, window: u16, seg_seq: TcpSeqNumber, seg_ack: TcpSeqNumber) {
    self.snd.window = (window as u32) << self.snd.window_scale;
    self.snd.wl1 = seg_seq;
    self.snd.wl2 = seg_ack;
    self.trace(format_args!("window update, new window {}", self.snd.window));
    if self.snd.window == 0 {
      // Zero window: probe it. A fresh arming starts at the current RTO;
      // an already armed persist timer keeps its doubled timeout.
      if !self.persist.armed() && (self.snd.unsent_len > 0 || self.close_pending || self.snd.closed)
      {
        self.persist_timeout = self.rto.rto();
        self.start_persist_timer();
      }
    } else {
      self.stop_persist_timer();
    }
  }

  fn set_retransmit_timer_after_ack(&mut self) {
    if self.snd.data.is_empty() {
      // everything outstanding is acked, stop the timer
      self.stop_retransmit_timer();
      self.signal_all_data_acked();
    } else {
      // new data was acked, restart
      self.start_retransmit_timer();
    }
  }

  fn exit_fast_recovery(&mut self) {
    self.snd.dupacks = 0;
    self.snd.limited_transfer = 0;
    self.snd.partial_ack = 0;
  }

  pub(crate) fn flight_size(&self) -> u32 {
    self.snd.data.iter().map(|seg| seg.data_remaining).sum()
  }

  fn update_rto(&mut self, tx_time: Instant) {
    self.rto.sample(self.now - tx_time);
  }

  fn update_cwnd(&mut self, acked_bytes: u32) {
    let smss = self.snd.mss as u32;
    if self.snd.cwnd < self.snd.ssthresh {
      // slow start
      self.snd.cwnd += core::cmp::min(acked_bytes, smss);
    } else {
      // congestion avoidance
      self.snd.cwnd += core::cmp::max(1, smss * smss / self.snd.cwnd);
    }
  }

  // ==== reassembly ==========================================================

  fn insert_out_of_order(&mut self, seg_seq: TcpSeqNumber, p: Packet) {
    self.rcv.out_of_order.merge(seg_seq, p);
  }

  fn merge_out_of_order(&mut self) -> bool {
    let (next, merged) = self
      .rcv
      .out_of_order
      .merge_into(self.rcv.next, &mut self.rcv.data);
    self.rcv.next = next;
    merged
  }

  // ==== delayed ACK =========================================================

  fn should_send_ack(&mut self, seg_len: u32) -> bool {
    // a TSO-assembled super-segment is acked immediately
    if seg_len > self.rcv.mss as u32 {
      self.nr_full_seg_received = 0;
      self.delayed_ack.cancel();
      return true;
    }

    // ack every second full-sized segment
    if seg_len == self.rcv.mss as u32 {
      self.nr_full_seg_received += 1;
      if self.nr_full_seg_received >= 2 {
        self.nr_full_seg_received = 0;
        self.delayed_ack.cancel();
        return true;
      }
    }

    if self.delayed_ack.armed() {
      return false;
    }

    // RFC 1122 allows up to 500ms; most implementations use 200ms.
    self.delayed_ack.rearm(self.now + self.cfg.delayed_ack_timeout);
    false
  }

  fn clear_delayed_ack(&mut self) {
    self.delayed_ack.cancel();
  }

  // ==== application surface =================================================

  pub(crate) fn send_queue_ready(&self, len: usize) -> bool {
    self.snd.user_queue_space >= len
  }

  pub(crate) fn reserve_queued(&mut self, len: usize) {
    self.snd.queued_len += len as u32;
  }

  pub(crate) fn unreserve_queued(&mut self, len: usize) {
    self.snd.queued_len -= len as u32;
    self.signal_all_data_acked();
  }

  pub(crate) fn register_space_waker(&mut self, waker: Waker) {
    self.snd.space_waiters.push_back(waker);
  }

  /// Move an application packet into the unsent queue. The caller has
  /// already checked `send_queue_ready` and holds a `queued_len`
  /// reservation, which transfers to `unsent_len` here.
  pub(crate) fn admit_send(&mut self, p: Packet) {
    debug_assert!(!self.snd.closed);
    let len = p.len();
    self.snd.user_queue_space -= len;
    self.snd.queued_len -= len as u32;
    self.snd.unsent_len += len as u32;
    self.snd.unsent.push_back(p);
    if self.can_send() > 0 {
      self.output();
    } else if self.snd.window == 0
      && !matches!(self.state, State::Closed | State::Listen | State::SynSent)
      && !self.persist.armed()
    {
      self.persist_timeout = self.rto.rto();
      self.start_persist_timer();
    }
  }

  fn release_queue_space(&mut self, len: usize) {
    self.snd.user_queue_space += len;
    self.wake_senders();
  }

  fn wake_senders(&mut self) {
    for w in self.snd.space_waiters.drain(..) {
      w.wake();
    }
  }

  pub(crate) fn has_rcv_data(&self) -> bool {
    !self.rcv.data.is_empty()
  }

  pub(crate) fn foreign_will_not_send(&self) -> bool {
    matches!(
      self.state,
      State::Closing | State::TimeWait | State::CloseWait | State::LastAck | State::Closed
    )
  }

  pub(crate) fn register_data_waker(&mut self, waker: Waker) {
    self.rcv.data_waker = Some(waker);
  }

  pub(crate) fn register_all_acked_waker(&mut self, waker: Waker) {
    self.snd.all_data_acked_waker = Some(waker);
  }

  pub(crate) fn all_data_acked(&self) -> bool {
    self.snd.data.is_empty() && self.snd.unsent_len == 0 && self.snd.queued_len == 0
  }

  /// Concatenate and drain the in-order receive queue.
  pub(crate) fn read(&mut self) -> Packet {
    let mut p = Packet::new();
    for q in self.rcv.data.drain(..) {
      p.append(q);
    }
    p
  }

  pub(crate) fn send_closed(&self) -> bool {
    self.snd.closed || self.close_pending
  }

  /// Half-close the send direction. The FIN goes out once everything queued
  /// has been sent and acknowledged.
  pub(crate) fn close(&mut self) {
    if self.state == State::Closed || self.send_closed() {
      return;
    }
    self.close_pending = true;
    self.maybe_complete_close();
  }

  fn maybe_complete_close(&mut self) {
    if !self.close_pending || !self.all_data_acked() {
      return;
    }
    self.close_pending = false;
    self.snd.closed = true;
    self.trace(format_args!("local close, unsent drained"));
    match self.state {
      State::CloseWait => {
        self.trace(format_args!("CLOSE_WAIT -> LAST_ACK"));
        self.state = State::LastAck;
      }
      State::Established => {
        self.trace(format_args!("ESTABLISHED -> FIN_WAIT_1"));
        self.state = State::FinWait1;
      }
      _ => {}
    }
    // Emit the FIN segment eagerly; queueing through output() alone could
    // hand the pump a packet built before the FIN decision.
    self.output_one();
    self.output();
  }

  fn signal_data_received(&mut self) {
    if let Some(w) = self.rcv.data_waker.take() {
      w.wake();
    }
  }

  fn signal_all_data_acked(&mut self) {
    if self.all_data_acked() {
      if let Some(w) = self.snd.all_data_acked_waker.take() {
        w.wake();
      }
      self.maybe_complete_close();
    }
  }

  // ==== flags on outgoing segments ==========================================

  fn syn_needs_on(&self) -> bool {
    matches!(self.state, State::SynSent | State::SynReceived)
  }

  fn fin_needs_on(&self) -> bool {
    matches!(
      self.state,
      State::FinWait1 | State::Closing | State::LastAck
    ) && self.snd.closed
      && self.snd.unsent_len == 0
      && self.snd.queued_len == 0
  }

  fn ack_needs_on(&self) -> bool {
    !matches!(self.state, State::Closed | State::Listen | State::SynSent)
  }

  // ==== output ==============================================================

  /// How much the windows allow us to transmit right now.
  fn can_send(&self) -> u32 {
    if self.snd.window_probe {
      return 1;
    }
    // not more than the advertised window allows
    let window_room = core::cmp::max(
      (self.snd.unacknowledged + self.snd.window as usize).distance(self.snd.next),
      0,
    ) as u32;
    let mut x = core::cmp::min(window_room, self.snd.unsent_len);
    // not more than the congestion window allows beyond what is in flight;
    // on the first two duplicate ACKs the budget is cwnd + 2*SMSS (RFC 3042
    // limited transmit)
    let budget = if self.snd.dupacks == 1 || self.snd.dupacks == 2 {
      self.snd.cwnd + 2 * self.snd.mss as u32
    } else {
      self.snd.cwnd
    };
    x = core::cmp::min(x, budget.saturating_sub(self.flight_size()));
    if self.snd.dupacks >= 3 {
      // at most one full-sized segment while loss recovery is under way
      x = core::cmp::min(self.snd.mss as u32, x);
    }
    x
  }

  /// Carve the next payload off the unsent queue.
  fn get_transmit_packet(&mut self) -> Packet {
    if self.snd.unsent.is_empty() {
      return Packet::new();
    }
    let mut can_send = self.can_send();
    // the payload handed to the NIC is bounded by what it can take
    let max_pktlen = if self.hw.tx_tso {
      self.hw.max_packet_len as u32 - TCP_HEADER_LEN as u32 - I::IP_HDR_LEN_MIN as u32
    } else {
      core::cmp::min(
        self.hw.mtu as u32 - TCP_HEADER_LEN as u32 - I::IP_HDR_LEN_MIN as u32,
        self.snd.mss as u32,
      )
    };
    can_send = core::cmp::min(can_send, max_pktlen);

    let mut p = Packet::new();
    let mut remaining = can_send as usize;
    while remaining > 0 {
      let Some(front) = self.snd.unsent.front_mut() else {
        break;
      };
      if front.len() <= remaining {
        remaining -= front.len();
        p.append(self.snd.unsent.pop_front().unwrap());
      } else {
        p.append(front.share_prefix(remaining));
        front.trim_front(remaining);
        remaining = 0;
      }
    }
    self.snd.unsent_len -= p.len() as u32;
    if self.snd.dupacks == 1 || self.snd.dupacks == 2 {
      // account what limited transmit put in flight
      self.snd.limited_transfer += p.len() as u32;
    }
    p
  }

  /// Build one segment and queue it for the pump.
  pub(crate) fn output_one(&mut self) {
    if self.state == State::Closed {
      return;
    }

    let mut p = self.get_transmit_packet();
    let len = p.len();
    let syn_on = self.syn_needs_on();
    let ack_on = self.ack_needs_on();
    if ack_on {
      self.clear_delayed_ack();
    }

    self.snd.next += len;
    let fin_on = self.fin_needs_on();

    let options_size = self.opts.emit_size(syn_on, ack_on);
    let th = TcpHeader {
      src_port: self.local_port,
      dst_port: self.foreign_port,
      seq: if syn_on {
        self.snd.initial.0
      } else {
        (self.snd.next - len as u32).0
      },
      ack: if ack_on { self.rcv.next.0 } else { 0 },
      data_offset: ((TCP_HEADER_LEN + options_size) / 4) as u8,
      f_syn: syn_on,
      f_ack: ack_on,
      f_fin: fin_on,
      window: core::cmp::min(self.rcv.window >> self.rcv.window_scale, 0xffff) as u16,
      ..TcpHeader::default()
    };

    let mut hdr = BytesMut::zeroed(TCP_HEADER_LEN + options_size);
    th.build(&mut hdr);
    self.opts.emit(&mut hdr[TCP_HEADER_LEN..], syn_on, ack_on);

    let mut oi = OffloadInfo {
      protocol: surge_packet::IP_PROTO_TCP,
      tcp_hdr_len: (TCP_HEADER_LEN + options_size) as u8,
      needs_csum: false,
    };
    let mut csum = Checksummer::new();
    I::pseudo_header_sum(&mut csum, self.local_ip, self.foreign_ip, hdr.len() + p.len());
    let checksum = if self.hw.tx_csum_l4_offload {
      // The NIC wants the checksum field seeded with the ones' complement
      // sum of the pseudo header, which it then completes.
      oi.needs_csum = true;
      !csum.get()
    } else {
      csum.sum(&hdr);
      for frag in p.fragments() {
        csum.sum(frag);
      }
      csum.get()
    };
    hdr[16..18].copy_from_slice(&checksum.to_be_bytes());
    p.prepend(hdr.freeze());
    p.set_offload_info(oi);

    if len > 0 || syn_on || fin_on {
      if len > 0 {
        self.snd.data.push_back(UnackedSegment {
          p: p.share(),
          data_len: len as u32,
          data_remaining: len as u32,
          nr_transmits: 0,
          tx_time: self.now,
        });
      }
      if !self.retransmit.armed() {
        self.start_retransmit_timer();
      }
    }

    self.queue_packet(p);
  }

  fn queue_packet(&mut self, p: Packet) {
    self.packetq.push_back(p);
  }

  /// Put this TCB on the shard's polling set, once.
  pub(crate) fn output(&mut self) {
    if !self.poll_active {
      self.poll_active = true;
      if let Some(me) = self.me.upgrade() {
        self.egress.borrow_mut().poll_tcbs.push_back(me);
      }
    }
  }

  /// One pull by the packet pump.
  pub(crate) fn get_packet(&mut self, now: Instant) -> Option<(I::Addr, Packet)> {
    self.now = now;
    self.poll_active = false;
    if self.packetq.is_empty() {
      self.output_one();
    }

    if self.state == State::Closed {
      return None;
    }

    let p = self.packetq.pop_front()?;
    if !self.packetq.is_empty() || (self.snd.dupacks < 3 && self.can_send() > 0) {
      // keep polling while there is more to send, unless three duplicate
      // ACKs suggest a loss is being repaired
      self.output();
    }
    Some((self.foreign_ip, p))
  }

  fn respond_with_reset(&mut self, th: &TcpHeader) {
    let (local_ip, foreign_ip) = (self.local_ip, self.foreign_ip);
    self
      .egress
      .borrow_mut()
      .respond_with_reset(th, local_ip, foreign_ip, 0);
  }

  // ==== timers ==============================================================

  fn start_retransmit_timer(&mut self) {
    self.retransmit.rearm(self.now + self.rto.rto());
  }

  fn stop_retransmit_timer(&mut self) {
    self.retransmit.cancel();
  }

  fn start_persist_timer(&mut self) {
    self.persist.rearm(self.now + self.persist_timeout);
  }

  fn stop_persist_timer(&mut self) {
    self.persist.cancel();
  }

  pub(crate) fn on_timers(&mut self, now: Instant) {
    self.now = now;
    if self.delayed_ack.expired(now) {
      self.delayed_ack.cancel();
      self.nr_full_seg_received = 0;
      self.output();
    }
    if self.retransmit.expired(now) {
      self.retransmit.cancel();
      self.retransmit_fire();
    }
    if self.persist.expired(now) {
      self.persist.cancel();
      self.persist_fire();
    }
    if self.time_wait.expired(now) {
      self.time_wait.cancel();
      self.trace(format_args!("TIME_WAIT -> CLOSED"));
      self.do_closed();
    }
  }

  pub(crate) fn poll_at(&self) -> Option<Instant> {
    [
      self.delayed_ack.deadline(),
      self.retransmit.deadline(),
      self.persist.deadline(),
      self.time_wait.deadline(),
    ]
    .into_iter()
    .flatten()
    .min()
  }

  /// Send a one-byte segment to probe a zero window, then back off.
  fn persist_fire(&mut self) {
    if self.snd.unsent_len == 0 && !self.fin_needs_on() {
      // nothing left to probe for
      return;
    }
    self.trace(format_args!("zero window probe"));
    self.snd.window_probe = true;
    self.output_one();
    self.snd.window_probe = false;
    self.output();
    // binary exponential back-off per RFC 1122
    self.persist_timeout = core::cmp::min(self.persist_timeout * 2, PERSIST_MAX);
    self.start_persist_timer();
  }

  fn retransmit_fire(&mut self) {
    // SYN first
    if self.syn_needs_on() {
      if self.snd.syn_retransmit < MAX_NR_RETRANSMIT {
        self.snd.syn_retransmit += 1;
        self.trace(format_args!("retransmit SYN nr {}", self.snd.syn_retransmit));
        self.output();
        self.rto.back_off();
        self.start_retransmit_timer();
      } else {
        self.fail(TcpError::ConnectError);
      }
      return;
    }

    // then an outstanding FIN
    if self.fin_needs_on() {
      if self.snd.fin_retransmit < MAX_NR_RETRANSMIT {
        self.snd.fin_retransmit += 1;
        self.trace(format_args!("retransmit FIN nr {}", self.snd.fin_retransmit));
        self.output();
        self.rto.back_off();
        self.start_retransmit_timer();
      } else {
        self.fail(TcpError::Reset);
      }
      return;
    }

    // then data: resend the earliest unacked segment
    if self.snd.data.is_empty() {
      return;
    }

    let smss = self.snd.mss as u32;
    if self.snd.data.front().map_or(false, |seg| seg.nr_transmits == 0) {
      // RFC 5681: collapse ssthresh only on the first retransmission
      self.snd.ssthresh = core::cmp::max(self.flight_size() / 2, 2 * smss);
    }
    // RFC 6582 step 4
    self.snd.recover = self.snd.next - 1u32;
    // restart slow start and leave fast recovery
    self.snd.cwnd = smss;
    self.exit_fast_recovery();

    let Some(front) = self.snd.data.front_mut() else {
      return;
    };
    if front.nr_transmits < MAX_NR_RETRANSMIT {
      front.nr_transmits += 1;
    } else {
      // the peer is gone, give up on the connection
      self.fail(TcpError::Reset);
      return;
    }
    let p = front.p.share();
    let nr_transmits = front.nr_transmits;
    self.trace(format_args!("retransmit data, nr {}", nr_transmits));
    self.queue_packet(p);

    self.output();
    self.rto.back_off();
    self.start_retransmit_timer();
  }

  fn fast_retransmit(&mut self) {
    if let Some(front) = self.snd.data.front_mut() {
      front.nr_transmits += 1;
      let p = front.p.share();
      self.queue_packet(p);
      self.output();
    }
  }
}
