use std::fmt;

use crate::protocol::ConnectReturnCode;

/// Error type for broker client operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No live broker connection
    NotConnected,
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// Connect or CONNACK timed out
    Timeout,
    /// Broker sent something that is not valid MQTT v3.1.1
    Protocol(String),
    /// Topic name or filter is not valid
    InvalidTopic(String),
    /// Outgoing packet exceeds the configured maximum packet size
    PacketTooLarge { size: usize, max: usize },
    /// Client has been shut down
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "Not connected to broker"),
            ClientError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ClientError::Rejected(code) => write!(f, "Connection rejected: {}", code),
            ClientError::Timeout => write!(f, "Operation timed out"),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
            ClientError::PacketTooLarge { size, max } => {
                write!(f, "Packet of {} bytes exceeds maximum of {}", size, max)
            }
            ClientError::Closed => write!(f, "Client closed"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::ConnectionLost(e.to_string())
    }
}
