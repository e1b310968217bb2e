//! 32-bit wrap-safe sequence numbers.
//!
//! All ordering in the engine goes through the modular relation: `a < b` iff
//! the truncated 32-bit difference `a - b`, viewed as signed, is negative.

use core::ops;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct TcpSeqNumber(pub u32);

impl TcpSeqNumber {
  /// Signed modular distance to `other`.
  pub fn distance(self, other: TcpSeqNumber) -> i32 {
    self.0.wrapping_sub(other.0) as i32
  }
}

impl PartialOrd for TcpSeqNumber {
  fn partial_cmp(&self, other: &TcpSeqNumber) -> Option<core::cmp::Ordering> {
    self.distance(*other).partial_cmp(&0)
  }
}

impl core::fmt::Display for TcpSeqNumber {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl ops::Add<u32> for TcpSeqNumber {
  type Output = TcpSeqNumber;

  fn add(self, rhs: u32) -> TcpSeqNumber {
    TcpSeqNumber(self.0.wrapping_add(rhs))
  }
}

impl ops::Add<usize> for TcpSeqNumber {
  type Output = TcpSeqNumber;

  fn add(self, rhs: usize) -> TcpSeqNumber {
    debug_assert!(rhs <= u32::MAX as usize);
    TcpSeqNumber(self.0.wrapping_add(rhs as u32))
  }
}

impl ops::AddAssign<u32> for TcpSeqNumber {
  fn add_assign(&mut self, rhs: u32) {
    *self = *self + rhs;
  }
}

impl ops::AddAssign<usize> for TcpSeqNumber {
  fn add_assign(&mut self, rhs: usize) {
    *self = *self + rhs;
  }
}

impl ops::Sub<u32> for TcpSeqNumber {
  type Output = TcpSeqNumber;

  fn sub(self, rhs: u32) -> TcpSeqNumber {
    TcpSeqNumber(self.0.wrapping_sub(rhs))
  }
}

/// Distance between two sequence numbers the caller knows to be ordered.
impl ops::Sub for TcpSeqNumber {
  type Output = usize;

  fn sub(self, rhs: TcpSeqNumber) -> usize {
    let diff = self.distance(rhs);
    debug_assert!(diff >= 0, "sequence numbers subtracted out of order");
    diff as usize
  }
}
