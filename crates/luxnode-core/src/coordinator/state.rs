//! Published connection snapshot.

use std::fmt;

use crate::model::{Device, DeviceCharacteristics};
use crate::operation::OperationError;

/// Link state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionStatus::Connecting => write!(f, "CONNECTING"),
            ConnectionStatus::Connected => write!(f, "CONNECTED"),
            ConnectionStatus::Disconnecting => write!(f, "DISCONNECTING"),
        }
    }
}

/// Immutable snapshot published after every mutation.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub device: Option<Device>,
    pub characteristics: DeviceCharacteristics,
    pub is_connecting: bool,
    pub connection_status: ConnectionStatus,
    /// Most recent operation failure. Cleared when the link reaches `Connected`.
    pub last_error: Option<OperationError>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }
}
