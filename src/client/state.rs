use std::fmt;

/// Lifecycle of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected and not trying to connect
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// CONNACK accepted, traffic flowing
    Connected,
    /// Waiting before the next connection attempt
    ReconnectPending,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectPending => "reconnect pending",
        };
        f.write_str(s)
    }
}
