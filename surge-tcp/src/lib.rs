//! A user-space TCP protocol engine.
//!
//! The engine implements RFC 793 with the congestion control and loss
//! recovery refinements of RFC 5681, RFC 6298, RFC 6582 and RFC 3042. It
//! sits above a datagram IP layer (the [`inet::Inet`] binding) and below an
//! application consuming byte-stream connections through [`socket`] handles.
//!
//! A shard owns one [`stack::Tcp`] instance. Ingress enters at
//! [`stack::Tcp::received`]; egress is pulled by the process-level packet
//! pump from [`stack::Tcp::poll_packet`]; timers are driven by
//! [`stack::Tcp::on_timers`] using the deadline from
//! [`stack::Tcp::poll_at`]. All of it is single-threaded and cooperative;
//! only the application-facing futures suspend.

pub mod config;
pub mod error;
pub mod inet;
pub mod isn;
pub mod reassembler;
pub mod rto;
pub mod seq;
pub mod socket;
pub mod stack;
pub mod tcb;
pub mod time;

pub use config::TcpConfig;
pub use error::TcpError;
pub use inet::{HwFeatures, Inet, Ipv4Inet, L4Packet, SocketAddress};
pub use seq::TcpSeqNumber;
pub use socket::{Connection, Listener};
pub use stack::Tcp;
pub use tcb::State;
pub use time::{Duration, Instant};
