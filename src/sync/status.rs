//! Hub connection status

use std::fmt;

/// Hub connection status, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Connected and identified with the hub
    Connected,
    /// Not connected (initial state, or sync disabled)
    Disconnected,
    /// Waiting before reconnection attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
    /// Gave up after the configured number of attempts
    ///
    /// Local changes still apply and still queue; a manual reconnect
    /// restarts the cycle.
    Degraded,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionStatus::Degraded => write!(f, "degraded"),
        }
    }
}
