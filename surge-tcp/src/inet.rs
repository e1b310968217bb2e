//! The binding between the TCP engine and the IP layer below it.

use core::fmt::{Debug, Display};
use core::hash::{Hash, Hasher};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use surge_packet::checksum::{self, Checksummer};
use surge_packet::ether::MacAddr;
use surge_packet::Packet;

/// Capabilities advertised by the device below the IP layer.
#[derive(Debug, Clone, Copy)]
pub struct HwFeatures {
  pub mtu: u16,
  pub max_packet_len: u16,
  pub tx_tso: bool,
  pub tx_csum_l4_offload: bool,
  pub rx_csum_offload: bool,
}

impl Default for HwFeatures {
  fn default() -> HwFeatures {
    HwFeatures {
      mtu: 1500,
      max_packet_len: 65535,
      tx_tso: false,
      tx_csum_l4_offload: false,
      rx_csum_offload: false,
    }
  }
}

/// An L4 packet polled from the stack, ready for the IP layer. The L2
/// next-hop address has already been attached.
#[derive(Debug)]
pub struct L4Packet<A> {
  pub to: A,
  pub p: Packet,
  pub e_dst: MacAddr,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SocketAddress<A> {
  pub addr: A,
  pub port: u16,
}

/// The connection 4-tuple, the demultiplexer key.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ConnId<A> {
  pub local_ip: A,
  pub foreign_ip: A,
  pub local_port: u16,
  pub foreign_port: u16,
}

impl<A: Hash> ConnId<A> {
  pub fn hash64(&self) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    self.hash(&mut h);
    h.finish()
  }
}

/// Address-family binding for the engine. The same engine serves IPv4 and,
/// with another implementation of this trait, IPv6.
pub trait Inet {
  type Addr: Copy + Eq + Hash + Display + Debug;

  /// Minimum IP header length, used to derive the local MSS from the MTU.
  const IP_HDR_LEN_MIN: usize;

  /// Contribute the pseudo header covering addresses, protocol and TCP
  /// length to a checksum.
  fn pseudo_header_sum(csum: &mut Checksummer, src: Self::Addr, dst: Self::Addr, tcp_len: usize);

  fn hw_features(&self) -> HwFeatures;

  fn host_address(&self) -> Self::Addr;

  /// Resolve the L2 next hop for `addr`. Consulted when a packet is pulled
  /// from the stack, so resolution latency never blocks the engine.
  fn l2_dst_address(&mut self, addr: Self::Addr) -> MacAddr;

  /// Whether a connection id hash is steered to this shard. `connect`
  /// rejects ephemeral ports that would land on another shard.
  fn steers_to_shard(&self, _connid_hash: u64) -> bool {
    true
  }
}

/// IPv4 binding backed by a static neighbor table.
#[derive(Debug)]
pub struct Ipv4Inet {
  pub host: Ipv4Addr,
  pub hw: HwFeatures,
  pub neighbors: HashMap<Ipv4Addr, MacAddr>,
}

impl Ipv4Inet {
  pub fn new(host: Ipv4Addr) -> Ipv4Inet {
    Ipv4Inet {
      host,
      hw: HwFeatures::default(),
      neighbors: HashMap::new(),
    }
  }
}

impl Inet for Ipv4Inet {
  type Addr = Ipv4Addr;

  const IP_HDR_LEN_MIN: usize = 20;

  fn pseudo_header_sum(csum: &mut Checksummer, src: Ipv4Addr, dst: Ipv4Addr, tcp_len: usize) {
    checksum::sum_pseudo_header_v4(csum, src, dst, surge_packet::IP_PROTO_TCP, tcp_len);
  }

  fn hw_features(&self) -> HwFeatures {
    self.hw
  }

  fn host_address(&self) -> Ipv4Addr {
    self.host
  }

  fn l2_dst_address(&mut self, addr: Ipv4Addr) -> MacAddr {
    self
      .neighbors
      .get(&addr)
      .copied()
      .unwrap_or(MacAddr::BROADCAST)
  }
}
