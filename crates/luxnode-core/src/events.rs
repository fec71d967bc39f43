//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to subscribe to link events without
//! tight coupling to the coordinator.

use std::fmt;

use uuid::Uuid;

use crate::coordinator::ConnectionStatus;
use crate::operation::OperationError;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Attribute traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Central -> node
    Rx, // Node -> central
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Connection status changed.
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// An operation finished with an error.
    OperationFailed { error: OperationError },
    /// Authentication handshake completed.
    Authenticated { device: Uuid },
    /// Attribute request sent or received.
    Attribute {
        direction: PacketDirection,
        uuid: Option<Uuid>,
        request: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving coordinator events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait NodeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &NodeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl NodeObserver for NullObserver {
    fn on_event(&self, _event: &NodeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl NodeObserver for TracingObserver {
    fn on_event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::StatusChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Connection status changed");
            }
            NodeEvent::OperationFailed { error } => {
                tracing::warn!(error = %error, "Operation failed");
            }
            NodeEvent::Authenticated { device } => {
                tracing::info!(device = %device, "Node authenticated");
            }
            NodeEvent::Attribute {
                direction,
                uuid,
                request,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    uuid = ?uuid,
                    request = %request,
                    len = length,
                    "Attribute request"
                );
            }
            NodeEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub events: Mutex<Vec<NodeEvent>>,
    }

    impl NodeObserver for RecordingObserver {
        fn on_event(&self, event: &NodeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::default();
        observer.on_event(&NodeEvent::Log {
            level: LogLevel::Info,
            message: "hello".into(),
        });
        assert_eq!(observer.events.lock().unwrap().len(), 1);
    }
}
