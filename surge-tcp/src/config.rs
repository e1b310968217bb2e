use crate::time::Duration;

/// Stack-wide tunables, copied into each TCB at creation.
#[derive(Debug, Clone)]
pub struct TcpConfig {
  /// How long a connection lingers in TIME_WAIT before the TCB is deleted.
  /// 2 * MSL; typical MSL values are 30-120 s.
  pub time_wait_timeout: Duration,
  /// Deadline for a delayed acknowledgment. RFC 1122 caps this at 500 ms;
  /// most implementations use 200 ms.
  pub delayed_ack_timeout: Duration,
  /// Per-connection budget for bytes queued by the application and not yet
  /// acknowledged, enforced by the `send` future.
  pub user_queue_space: usize,
  /// Default backlog for listeners.
  pub listen_backlog: usize,
}

impl Default for TcpConfig {
  fn default() -> TcpConfig {
    TcpConfig {
      time_wait_timeout: Duration::from_secs(60),
      delayed_ack_timeout: Duration::from_millis(200),
      user_queue_space: 212992,
      listen_backlog: 100,
    }
  }
}
