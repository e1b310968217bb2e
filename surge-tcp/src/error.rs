/// Errors surfaced to the application.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpError {
  /// The SYN retransmit budget was exhausted before the peer answered.
  ConnectError,
  /// The peer answered the connection attempt with RST.
  Refused,
  /// The connection was reset, by the peer or by forced local teardown.
  Reset,
}

impl core::fmt::Display for TcpError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      TcpError::ConnectError => write!(f, "fail to connect"),
      TcpError::Refused => write!(f, "connection refused"),
      TcpError::Reset => write!(f, "connection is reset"),
    }
  }
}

impl std::error::Error for TcpError {}

/// Error returned by `Tcp::listen`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ListenError {
  PortInUse(u16),
}

impl core::fmt::Display for ListenError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      ListenError::PortInUse(port) => write!(f, "port {} already listening", port),
    }
  }
}

impl std::error::Error for ListenError {}
