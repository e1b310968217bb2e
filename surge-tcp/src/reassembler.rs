//! Out-of-order segment reassembly.
//!
//! A sorted, non-overlapping store of received segments keyed by their start
//! sequence number. Ordering is the modular sequence relation; entries
//! cluster inside the receive window so the relation is total over the live
//! keys.

use std::collections::VecDeque;

use surge_packet::Packet;

use crate::seq::TcpSeqNumber;

#[derive(Debug, Default)]
pub struct PacketMerger {
  segs: VecDeque<(TcpSeqNumber, Packet)>,
}

impl PacketMerger {
  pub fn new() -> PacketMerger {
    PacketMerger::default()
  }

  pub fn is_empty(&self) -> bool {
    self.segs.is_empty()
  }

  pub fn len(&self) -> usize {
    self.segs.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (TcpSeqNumber, usize)> + '_ {
    self.segs.iter().map(|(seq, p)| (*seq, p.len()))
  }

  pub fn clear(&mut self) {
    self.segs.clear();
  }

  /// Insert a segment, trimming any bytes already covered by stored
  /// segments and swallowing stored segments it fully covers.
  pub fn merge(&mut self, mut seq: TcpSeqNumber, mut p: Packet) {
    if p.is_empty() {
      return;
    }
    let mut index = 0;
    while index < self.segs.len() && !p.is_empty() {
      let (stored_seq, stored_len) = {
        let (s, sp) = &self.segs[index];
        (*s, sp.len())
      };
      let stored_end = stored_seq + stored_len;
      let end = seq + p.len();

      if end <= stored_seq {
        // entirely before this entry; insertion point found
        break;
      }
      if seq >= stored_end {
        // entirely after this entry
        index += 1;
        continue;
      }
      // some overlap
      if seq >= stored_seq && end <= stored_end {
        // complete duplicate
        return;
      }
      if seq < stored_seq && end > stored_end {
        // new segment swallows the stored one
        self.segs.remove(index);
        continue;
      }
      if seq < stored_seq {
        // overlap at the front of the stored entry: keep our head
        p.truncate(stored_seq - seq);
        break;
      }
      // overlap at the tail of the stored entry: drop our head
      let dup = stored_end - seq;
      p.trim_front(dup);
      seq = stored_end;
      index += 1;
    }
    if !p.is_empty() {
      self.segs.insert(index, (seq, p));
    }
  }

  /// Move every segment made contiguous by `next` into `out`, advancing
  /// `next` over it. Entries entirely below `next` are dropped. Returns the
  /// advanced sequence number and whether anything was merged, which forces
  /// an immediate ACK per RFC 5681 section 4.2.
  pub fn merge_into(
    &mut self,
    mut next: TcpSeqNumber,
    out: &mut VecDeque<Packet>,
  ) -> (TcpSeqNumber, bool) {
    let mut merged = false;
    while let Some((seg_beg, p)) = self.segs.front_mut() {
      let seg_len = p.len();
      let seg_beg = *seg_beg;
      let seg_end = seg_beg + seg_len;
      if seg_beg <= next && next < seg_end {
        let trim = next - seg_beg;
        if trim > 0 {
          p.trim_front(trim);
        }
        next += seg_end - next;
        out.push_back(self.segs.pop_front().unwrap().1);
        merged = true;
      } else if next >= seg_end {
        // stale entry, already received
        self.segs.pop_front();
      } else {
        // gap remains; later keys can only be greater, stop here
        break;
      }
    }
    (next, merged)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn seg(at: u32, data: &[u8]) -> (TcpSeqNumber, Packet) {
    (TcpSeqNumber(at), Packet::from_slice(data))
  }

  fn contents(merger: &PacketMerger) -> Vec<(u32, usize)> {
    merger.iter().map(|(s, l)| (s.0, l)).collect()
  }

  #[test]
  fn test_merge_keeps_sorted_order() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(300, b"cc");
    m.merge(s, p);
    let (s, p) = seg(100, b"aa");
    m.merge(s, p);
    let (s, p) = seg(200, b"bb");
    m.merge(s, p);
    assert_eq!(contents(&m), vec![(100, 2), (200, 2), (300, 2)]);
  }

  #[test]
  fn test_merge_trims_duplicates() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(100, b"abcd");
    m.merge(s, p);
    // complete duplicate disappears
    let (s, p) = seg(101, b"bc");
    m.merge(s, p);
    assert_eq!(contents(&m), vec![(100, 4)]);
    // tail overlap keeps only the new head
    let (s, p) = seg(98, b"xyab");
    m.merge(s, p);
    assert_eq!(contents(&m), vec![(98, 2), (100, 4)]);
    // head overlap keeps only the new tail
    let (s, p) = seg(102, b"cdef");
    m.merge(s, p);
    assert_eq!(contents(&m), vec![(98, 2), (100, 4), (104, 2)]);
  }

  #[test]
  fn test_merge_swallows_covered_entries() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(104, b"cc");
    m.merge(s, p);
    let (s, p) = seg(108, b"dd");
    m.merge(s, p);
    let (s, p) = seg(100, b"0123456789ab");
    m.merge(s, p);
    assert_eq!(contents(&m), vec![(100, 12)]);
  }

  #[test]
  fn test_merge_into_in_order() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(100, b"aa");
    m.merge(s, p);
    let (s, p) = seg(102, b"bb");
    m.merge(s, p);
    let (s, p) = seg(110, b"zz");
    m.merge(s, p);

    let mut out = VecDeque::new();
    let (next, merged) = m.merge_into(TcpSeqNumber(100), &mut out);
    assert!(merged);
    assert_eq!(next, TcpSeqNumber(104));
    assert_eq!(out.len(), 2);
    // the gap at 104 stops the walk
    assert_eq!(contents(&m), vec![(110, 2)]);
    // every remaining key is strictly above next
    assert!(m.iter().all(|(s, _)| s > next));
  }

  #[test]
  fn test_merge_into_trims_partial_overlap() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(98, b"xxab");
    m.merge(s, p);
    let mut out = VecDeque::new();
    let (next, merged) = m.merge_into(TcpSeqNumber(100), &mut out);
    assert!(merged);
    assert_eq!(next, TcpSeqNumber(102));
    assert_eq!(out[0].to_vec(), b"ab");
  }

  #[test]
  fn test_merge_into_drops_stale() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(90, b"aa");
    m.merge(s, p);
    let mut out = VecDeque::new();
    let (next, merged) = m.merge_into(TcpSeqNumber(100), &mut out);
    assert!(!merged);
    assert_eq!(next, TcpSeqNumber(100));
    assert!(out.is_empty());
    assert!(m.is_empty());
  }

  #[test]
  fn test_nothing_to_merge_on_gap() {
    let mut m = PacketMerger::new();
    let (s, p) = seg(104, b"aa");
    m.merge(s, p);
    let mut out = VecDeque::new();
    let (next, merged) = m.merge_into(TcpSeqNumber(100), &mut out);
    assert!(!merged);
    assert_eq!(next, TcpSeqNumber(100));
    assert_eq!(m.len(), 1);
  }
}
