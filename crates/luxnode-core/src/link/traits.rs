//! Link transport abstraction.
//!
//! Defines the `LinkTransport` trait for the remote-attribute link,
//! allowing different implementations (btleplug, mock, etc.).
//!
//! Requests are non-blocking: a call either rejects synchronously with a
//! [`TransportError`] or is accepted, in which case exactly one matching
//! [`LinkEvent`] is later pushed into the link's [`EventSink`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::Device;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Link permission not granted")]
    PermissionDenied,

    #[error("Adapter not available: {0}")]
    AdapterUnavailable(String),

    #[error("Device not found: {address}")]
    DeviceNotFound { address: String },

    #[error("Link is not connected")]
    NotConnected,

    #[error("Link is closed")]
    Closed,

    #[error("Characteristic {0} not present in service table")]
    UnknownCharacteristic(Uuid),

    #[error("No reliable write in progress")]
    NoReliableWrite,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Asynchronous link-layer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionStateChanged { status: u8, connected: bool },
    ServicesDiscovered { status: u8 },
    CharacteristicRead { uuid: Uuid, status: u8, value: Vec<u8> },
    /// `value` is what the remote acknowledged (the queued value during a reliable write).
    CharacteristicWritten { uuid: Uuid, status: u8, value: Vec<u8> },
    /// Notification or indication.
    CharacteristicChanged { uuid: Uuid, value: Vec<u8> },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        status: u8,
    },
    MtuChanged { mtu: u16, status: u8 },
    ReliableWriteCompleted { status: u8 },
}

impl LinkEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::ConnectionStateChanged { .. } => "connection-state",
            LinkEvent::ServicesDiscovered { .. } => "services-discovered",
            LinkEvent::CharacteristicRead { .. } => "characteristic-read",
            LinkEvent::CharacteristicWritten { .. } => "characteristic-written",
            LinkEvent::CharacteristicChanged { .. } => "characteristic-changed",
            LinkEvent::DescriptorWritten { .. } => "descriptor-written",
            LinkEvent::MtuChanged { .. } => "mtu-changed",
            LinkEvent::ReliableWriteCompleted { .. } => "reliable-write-completed",
        }
    }
}

/// Single callback sink every link event is funnelled into.
#[derive(Debug, Clone)]
pub struct EventSink(mpsc::UnboundedSender<LinkEvent>);

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Deliver an event. Delivery after the receiver is gone is silently dropped.
    pub fn emit(&self, event: LinkEvent) {
        if self.0.send(event).is_err() {
            tracing::trace!("Event sink closed, dropping event");
        }
    }
}

/// Abstract remote-attribute link.
///
/// This trait enables:
/// - Production implementation using btleplug
/// - Mock implementation for unit testing
pub trait LinkTransport: Send + Sync {
    /// Open the radio connection. Answered by `ConnectionStateChanged`.
    fn connect(&self) -> Result<(), TransportError>;

    /// Drop the radio connection. Answered by `ConnectionStateChanged`.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Release the underlying handle. No further events are produced.
    fn close(&self);

    /// Answered by `ServicesDiscovered`.
    fn discover_services(&self) -> Result<(), TransportError>;

    /// Forget the cached service table. Synchronous.
    fn refresh(&self) -> Result<(), TransportError>;

    /// Whether the cached service table contains this characteristic.
    fn has_characteristic(&self, uuid: Uuid) -> bool;

    /// Answered by `CharacteristicRead`.
    fn read_characteristic(&self, uuid: Uuid) -> Result<(), TransportError>;

    /// Answered by `CharacteristicWritten`.
    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Start queueing writes. Synchronous.
    fn begin_reliable_write(&self) -> Result<(), TransportError>;

    /// Commit queued writes. Answered by `ReliableWriteCompleted`.
    fn execute_reliable_write(&self) -> Result<(), TransportError>;

    /// Discard queued writes. Synchronous.
    fn abort_reliable_write(&self) -> Result<(), TransportError>;

    /// Local notification routing switch. Synchronous.
    fn set_notification(&self, uuid: Uuid, enabled: bool) -> Result<(), TransportError>;

    /// Write a descriptor of `characteristic`. Answered by `DescriptorWritten`.
    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

/// Opens links for devices.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open(
        &self,
        device: &Device,
        sink: EventSink,
    ) -> Result<std::sync::Arc<dyn LinkTransport>, TransportError>;
}
