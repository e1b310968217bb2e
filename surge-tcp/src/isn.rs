//! Initial sequence number generation.
//!
//! RFC 6528 structure: `ISN = M + F(localip, localport, remoteip,
//! remoteport, secretkey)` where M is the 4 microsecond timer. The hash `F`
//! is behind the [`Isn`] trait so it can be swapped (e.g. for MD5 as in the
//! RFC's example) without any protocol-visible change.

use core::hash::{Hash, Hasher};

use siphasher::sip::SipHasher24;

use crate::inet::ConnId;
use crate::seq::TcpSeqNumber;
use crate::time::Instant;

pub trait Isn<A> {
  fn get(&mut self, id: &ConnId<A>, now: Instant) -> TcpSeqNumber;
}

/// Keyed SipHash-2-4 generator. The 128-bit secret is drawn from the system
/// RNG once per generator, i.e. once per process in the usual setup.
#[derive(Debug)]
pub struct IsnGenerator {
  key0: u64,
  key1: u64,
}

impl IsnGenerator {
  pub fn new() -> IsnGenerator {
    IsnGenerator {
      key0: rand::random(),
      key1: rand::random(),
    }
  }

  #[cfg(test)]
  fn with_keys(key0: u64, key1: u64) -> IsnGenerator {
    IsnGenerator { key0, key1 }
  }
}

impl Default for IsnGenerator {
  fn default() -> IsnGenerator {
    IsnGenerator::new()
  }
}

impl<A: Hash> Isn<A> for IsnGenerator {
  fn get(&mut self, id: &ConnId<A>, now: Instant) -> TcpSeqNumber {
    let mut hasher = SipHasher24::new_with_keys(self.key0, self.key1);
    id.hash(&mut hasher);
    let f = hasher.finish() as u32;
    let m = (now.total_micros() / 4) as u32;
    TcpSeqNumber(f.wrapping_add(m))
  }
}
