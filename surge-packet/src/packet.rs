use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Egress descriptor handed to the IP layer along with the packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct OffloadInfo {
  pub protocol: u8,
  pub tcp_hdr_len: u8,
  pub needs_csum: bool,
}

/// A shareable byte-segment holder.
///
/// Payload is a list of reference counted fragments, so `share` is an
/// aliasing copy and `trim_front`, `prepend` and `append` never move payload
/// bytes. This is the unit passed between the application, the protocol
/// engine and the device layers.
#[derive(Debug, Clone, Default)]
pub struct Packet {
  frags: VecDeque<Bytes>,
  len: usize,
  offload: OffloadInfo,
}

impl Packet {
  pub fn new() -> Packet {
    Packet::default()
  }

  pub fn from_slice(data: &[u8]) -> Packet {
    let mut p = Packet::new();
    if !data.is_empty() {
      p.append_frag(Bytes::copy_from_slice(data));
    }
    p
  }

  pub fn from_bytes(data: Bytes) -> Packet {
    let mut p = Packet::new();
    if !data.is_empty() {
      p.append_frag(data);
    }
    p
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn offload_info(&self) -> OffloadInfo {
    self.offload
  }

  pub fn set_offload_info(&mut self, oi: OffloadInfo) {
    self.offload = oi;
  }

  /// Aliasing copy of the whole packet. O(1) per fragment.
  pub fn share(&self) -> Packet {
    self.clone()
  }

  /// Aliasing copy of the first `len` bytes.
  pub fn share_prefix(&self, len: usize) -> Packet {
    assert!(len <= self.len);
    let mut p = Packet::new();
    let mut remaining = len;
    for frag in &self.frags {
      if remaining == 0 {
        break;
      }
      let take = remaining.min(frag.len());
      p.append_frag(frag.slice(..take));
      remaining -= take;
    }
    p
  }

  /// Drop the first `n` bytes.
  pub fn trim_front(&mut self, mut n: usize) {
    assert!(n <= self.len);
    self.len -= n;
    while n > 0 {
      let frag = self.frags.front_mut().unwrap();
      if frag.len() <= n {
        n -= frag.len();
        self.frags.pop_front();
      } else {
        *frag = frag.slice(n..);
        n = 0;
      }
    }
  }

  /// Keep only the first `len` bytes.
  pub fn truncate(&mut self, len: usize) {
    if len >= self.len {
      return;
    }
    let mut keep = len;
    let mut kept_frags = 0;
    for frag in self.frags.iter_mut() {
      if keep == 0 {
        break;
      }
      if frag.len() > keep {
        *frag = frag.slice(..keep);
      }
      keep -= frag.len().min(keep);
      kept_frags += 1;
    }
    self.frags.truncate(kept_frags);
    self.len = len;
  }

  /// Prepend a header fragment (used for the TCP header).
  pub fn prepend(&mut self, header: Bytes) {
    self.len += header.len();
    self.frags.push_front(header);
  }

  pub fn append(&mut self, mut other: Packet) {
    self.len += other.len;
    self.frags.append(&mut other.frags);
  }

  fn append_frag(&mut self, frag: Bytes) {
    self.len += frag.len();
    self.frags.push_back(frag);
  }

  pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
    self.frags.iter().map(|f| f.as_ref())
  }

  /// Collapse into a single fragment and return it. Cheap when the packet
  /// already is contiguous, which is the common ingress case.
  pub fn linearize(&mut self) -> &[u8] {
    if self.frags.len() > 1 {
      let mut buf = BytesMut::with_capacity(self.len);
      for frag in &self.frags {
        buf.extend_from_slice(frag);
      }
      self.frags.clear();
      self.frags.push_back(buf.freeze());
    }
    self.frags.front().map(|f| f.as_ref()).unwrap_or(&[])
  }

  pub fn to_vec(&self) -> Vec<u8> {
    let mut v = Vec::with_capacity(self.len);
    for frag in &self.frags {
      v.extend_from_slice(frag);
    }
    v
  }
}

impl PartialEq for Packet {
  fn eq(&self, other: &Packet) -> bool {
    self.len == other.len && self.to_vec() == other.to_vec()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn pkt(parts: &[&[u8]]) -> Packet {
    let mut p = Packet::new();
    for part in parts {
      p.append(Packet::from_slice(part));
    }
    p
  }

  #[test]
  fn test_trim_front_across_fragments() {
    let mut p = pkt(&[b"abc", b"def", b"gh"]);
    assert_eq!(p.len(), 8);
    p.trim_front(4);
    assert_eq!(p.to_vec(), b"efgh");
    p.trim_front(4);
    assert!(p.is_empty());
  }

  #[test]
  fn test_truncate_across_fragments() {
    let mut p = pkt(&[b"abc", b"def", b"gh"]);
    p.truncate(4);
    assert_eq!(p.to_vec(), b"abcd");
    p.truncate(0);
    assert!(p.is_empty());
  }

  #[test]
  fn test_share_prefix_is_aliasing() {
    let p = pkt(&[b"abcdef"]);
    let head = p.share_prefix(3);
    assert_eq!(head.to_vec(), b"abc");
    assert_eq!(p.to_vec(), b"abcdef");
  }

  #[test]
  fn test_prepend_and_linearize() {
    let mut p = pkt(&[b"payload"]);
    p.prepend(Bytes::from_static(b"hdr:"));
    assert_eq!(p.len(), 11);
    assert_eq!(p.linearize(), b"hdr:payload");
    assert_eq!(p.fragments().count(), 1);
  }

  #[test]
  fn test_share_does_not_copy_on_trim() {
    let p = pkt(&[b"abcdef"]);
    let mut q = p.share();
    q.trim_front(2);
    assert_eq!(p.to_vec(), b"abcdef");
    assert_eq!(q.to_vec(), b"cdef");
  }
}
