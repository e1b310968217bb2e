//! Application-facing handles: listeners, connections and their futures.
//!
//! Handles share ownership of the TCB with the demultiplexer map and the
//! polling set. The TCB itself only ever holds wakers back toward the
//! application, so dropping a handle can never leave a reference cycle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::channel::oneshot;
use surge_packet::Packet;

use crate::error::TcpError;
use crate::inet::{Inet, SocketAddress};
use crate::tcb::{State, Tcb};

/// The accept queue behind a listening port, shared between the
/// demultiplexer (producer) and the `Listener` handle (consumer).
pub(crate) struct ListenQueue<I: Inet> {
  pub(crate) port: u16,
  pub(crate) backlog: usize,
  pub(crate) q: VecDeque<Connection<I>>,
  pub(crate) open: bool,
  waker: Option<Waker>,
}

impl<I: Inet> ListenQueue<I> {
  pub(crate) fn new(port: u16, backlog: usize) -> ListenQueue<I> {
    ListenQueue {
      port,
      backlog,
      q: VecDeque::new(),
      open: true,
      waker: None,
    }
  }

  pub(crate) fn push(&mut self, conn: Connection<I>) {
    self.q.push_back(conn);
    if let Some(w) = self.waker.take() {
      w.wake();
    }
  }
}

pub struct Listener<I: Inet> {
  q: Rc<RefCell<ListenQueue<I>>>,
}

impl<I: Inet> Listener<I> {
  pub(crate) fn new(q: Rc<RefCell<ListenQueue<I>>>) -> Listener<I> {
    Listener { q }
  }

  pub fn port(&self) -> u16 {
    self.q.borrow().port
  }

  /// Wait for the next incoming connection, FIFO from the backlog.
  pub fn accept(&self) -> Accept<I> {
    Accept { q: self.q.clone() }
  }
}

impl<I: Inet> Drop for Listener<I> {
  fn drop(&mut self) {
    // The demultiplexer prunes the entry lazily; new SYNs take the RST path
    // as soon as `open` is false.
    self.q.borrow_mut().open = false;
  }
}

pub struct Accept<I: Inet> {
  q: Rc<RefCell<ListenQueue<I>>>,
}

impl<I: Inet> Future for Accept<I> {
  type Output = Connection<I>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Connection<I>> {
    let mut q = self.q.borrow_mut();
    match q.q.pop_front() {
      Some(conn) => Poll::Ready(conn),
      None => {
        q.waker = Some(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

/// A byte-stream connection handle.
///
/// Dropping the handle half-closes the send direction; the TCB stays alive
/// until the protocol machine is done with it.
pub struct Connection<I: Inet> {
  tcb: Rc<RefCell<Tcb<I>>>,
}

impl<I: Inet> Connection<I> {
  pub(crate) fn new(tcb: Rc<RefCell<Tcb<I>>>) -> Connection<I> {
    Connection { tcb }
  }

  pub fn state(&self) -> State {
    self.tcb.borrow().state()
  }

  pub fn peer(&self) -> SocketAddress<I::Addr> {
    let tcb = self.tcb.borrow();
    let id = tcb.conn_id();
    SocketAddress {
      addr: id.foreign_ip,
      port: id.foreign_port,
    }
  }

  /// Queue bytes for transmission. Resolves once the packet is accepted
  /// into the send queue (not when the remote ACKs it); applies
  /// backpressure through the per-connection queue-space budget.
  pub fn send(&self, p: Packet) -> SendFuture<I> {
    let len = p.len();
    self.tcb.borrow_mut().reserve_queued(len);
    SendFuture {
      tcb: self.tcb.clone(),
      p: Some(p),
      len,
    }
  }

  /// Wait until the receive queue is non-empty or no more data can arrive.
  pub fn wait_for_data(&self) -> WaitForData<I> {
    WaitForData {
      tcb: self.tcb.clone(),
    }
  }

  /// Drain the receive queue: the concatenation of all buffered in-order
  /// packets.
  pub fn read(&self) -> Packet {
    self.tcb.borrow_mut().read()
  }

  /// Wait until everything queued so far has been sent and acknowledged.
  pub fn wait_for_all_data_acked(&self) -> WaitForAllDataAcked<I> {
    WaitForAllDataAcked {
      tcb: self.tcb.clone(),
    }
  }

  /// Half-close the send direction. Queued data is flushed and the FIN goes
  /// out once it is all acknowledged.
  pub fn close_write(&self) {
    self.tcb.borrow_mut().close();
  }
}

impl<I: Inet> Drop for Connection<I> {
  fn drop(&mut self) {
    self.tcb.borrow_mut().close();
  }
}

pub struct SendFuture<I: Inet> {
  tcb: Rc<RefCell<Tcb<I>>>,
  p: Option<Packet>,
  len: usize,
}

impl<I: Inet> Future for SendFuture<I> {
  type Output = Result<(), TcpError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let mut tcb = this.tcb.borrow_mut();
    if this.p.is_none() {
      return Poll::Ready(Ok(()));
    }
    if let Some(err) = tcb.error() {
      this.p = None;
      tcb.unreserve_queued(this.len);
      return Poll::Ready(Err(err));
    }
    if tcb.state() == State::Closed {
      this.p = None;
      tcb.unreserve_queued(this.len);
      return Poll::Ready(Err(TcpError::Reset));
    }
    if tcb.send_queue_ready(this.len) {
      let p = this.p.take().unwrap();
      tcb.admit_send(p);
      Poll::Ready(Ok(()))
    } else {
      tcb.register_space_waker(cx.waker().clone());
      Poll::Pending
    }
  }
}

impl<I: Inet> Drop for SendFuture<I> {
  fn drop(&mut self) {
    // A cancelled send returns its queue reservation.
    if self.p.is_some() {
      self.tcb.borrow_mut().unreserve_queued(self.len);
    }
  }
}

pub struct WaitForData<I: Inet> {
  tcb: Rc<RefCell<Tcb<I>>>,
}

impl<I: Inet> Future for WaitForData<I> {
  type Output = Result<(), TcpError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut tcb = self.tcb.borrow_mut();
    if tcb.has_rcv_data() {
      return Poll::Ready(Ok(()));
    }
    if let Some(err) = tcb.error() {
      return Poll::Ready(Err(err));
    }
    if tcb.foreign_will_not_send() {
      return Poll::Ready(Ok(()));
    }
    tcb.register_data_waker(cx.waker().clone());
    Poll::Pending
  }
}

pub struct WaitForAllDataAcked<I: Inet> {
  tcb: Rc<RefCell<Tcb<I>>>,
}

impl<I: Inet> Future for WaitForAllDataAcked<I> {
  type Output = Result<(), TcpError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut tcb = self.tcb.borrow_mut();
    if let Some(err) = tcb.error() {
      return Poll::Ready(Err(err));
    }
    if tcb.all_data_acked() {
      return Poll::Ready(Ok(()));
    }
    tcb.register_all_acked_waker(cx.waker().clone());
    Poll::Pending
  }
}

pub struct ConnectFuture<I: Inet> {
  tcb: Option<Rc<RefCell<Tcb<I>>>>,
  rx: oneshot::Receiver<Result<(), TcpError>>,
}

impl<I: Inet> ConnectFuture<I> {
  pub(crate) fn new(
    tcb: Rc<RefCell<Tcb<I>>>,
    rx: oneshot::Receiver<Result<(), TcpError>>,
  ) -> ConnectFuture<I> {
    ConnectFuture { tcb: Some(tcb), rx }
  }
}

impl<I: Inet> Future for ConnectFuture<I> {
  type Output = Result<Connection<I>, TcpError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    match Pin::new(&mut this.rx).poll(cx) {
      Poll::Ready(Ok(Ok(()))) => {
        let tcb = this.tcb.take().expect("connect future polled after completion");
        Poll::Ready(Ok(Connection::new(tcb)))
      }
      Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
      // the TCB died without completing the handshake
      Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(TcpError::Reset)),
      Poll::Pending => Poll::Pending,
    }
  }
}
