//! Engine-internal time types.
//!
//! The engine never reads a wall clock; the packet pump supplies the current
//! instant at every entry point, which also makes the whole engine
//! deterministic under test.

use core::ops;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Hash)]
pub struct Instant {
  micros: i64,
}

impl Instant {
  pub const ZERO: Instant = Instant { micros: 0 };

  pub fn from_micros(micros: i64) -> Instant {
    Instant { micros }
  }

  pub fn from_millis(millis: i64) -> Instant {
    Instant {
      micros: millis * 1000,
    }
  }

  pub fn from_secs(secs: i64) -> Instant {
    Instant {
      micros: secs * 1_000_000,
    }
  }

  pub fn total_micros(&self) -> i64 {
    self.micros
  }

  pub fn total_millis(&self) -> i64 {
    self.micros / 1000
  }
}

impl core::fmt::Display for Instant {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "{}.{:03}s", self.micros / 1_000_000, (self.micros % 1_000_000) / 1000)
  }
}

impl ops::Add<Duration> for Instant {
  type Output = Instant;

  fn add(self, rhs: Duration) -> Instant {
    Instant::from_micros(self.micros + rhs.micros as i64)
  }
}

impl ops::AddAssign<Duration> for Instant {
  fn add_assign(&mut self, rhs: Duration) {
    self.micros += rhs.micros as i64;
  }
}

impl ops::Sub<Duration> for Instant {
  type Output = Instant;

  fn sub(self, rhs: Duration) -> Instant {
    Instant::from_micros(self.micros - rhs.micros as i64)
  }
}

impl ops::Sub<Instant> for Instant {
  type Output = Duration;

  fn sub(self, rhs: Instant) -> Duration {
    Duration::from_micros((self.micros - rhs.micros).max(0) as u64)
  }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, Hash)]
pub struct Duration {
  micros: u64,
}

impl Duration {
  pub const ZERO: Duration = Duration { micros: 0 };

  pub const fn from_micros(micros: u64) -> Duration {
    Duration { micros }
  }

  pub const fn from_millis(millis: u64) -> Duration {
    Duration {
      micros: millis * 1000,
    }
  }

  pub const fn from_secs(secs: u64) -> Duration {
    Duration {
      micros: secs * 1_000_000,
    }
  }

  pub fn total_micros(&self) -> u64 {
    self.micros
  }

  pub fn total_millis(&self) -> u64 {
    self.micros / 1000
  }
}

impl core::fmt::Display for Duration {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "{}ms", self.total_millis())
  }
}

impl ops::Add for Duration {
  type Output = Duration;

  fn add(self, rhs: Duration) -> Duration {
    Duration::from_micros(self.micros + rhs.micros)
  }
}

impl ops::Sub for Duration {
  type Output = Duration;

  fn sub(self, rhs: Duration) -> Duration {
    Duration::from_micros(self.micros.saturating_sub(rhs.micros))
  }
}

impl ops::Mul<u32> for Duration {
  type Output = Duration;

  fn mul(self, rhs: u32) -> Duration {
    Duration::from_micros(self.micros * rhs as u64)
  }
}

impl ops::Div<u32> for Duration {
  type Output = Duration;

  fn div(self, rhs: u32) -> Duration {
    Duration::from_micros(self.micros / rhs as u64)
  }
}

/// A one-shot, rearmable, cancellable deadline cell.
///
/// Cancelling an unarmed timer is a no-op. The owner observes expiry by
/// polling `expired` with the current time, so callbacks always run on the
/// owning shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
  deadline: Option<Instant>,
}

impl Timer {
  pub fn new() -> Timer {
    Timer::default()
  }

  pub fn armed(&self) -> bool {
    self.deadline.is_some()
  }

  pub fn rearm(&mut self, at: Instant) {
    self.deadline = Some(at);
  }

  pub fn cancel(&mut self) {
    self.deadline = None;
  }

  pub fn expired(&self, now: Instant) -> bool {
    matches!(self.deadline, Some(at) if now >= at)
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }
}
