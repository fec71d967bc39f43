//! Operation abstraction.
//!
//! An [`Operation`] is one self-contained exchange with the link: it knows how
//! to start itself and how to interpret each incoming [`LinkEvent`] until it
//! reaches a terminal [`Progress::Done`]. Operations never await; the
//! coordinator owns the suspension and guarantees a single pending operation.

pub mod attribute;
pub mod connection;
pub mod error;
pub mod reliable;

pub use attribute::{
    EnableIndication, ReadCharacteristic, WriteAwaitIndication, WriteCharacteristic, WriteVerify,
};
pub use connection::{Connect, Disconnect, DiscoverServices};
pub use error::{GattError, GattErrorKind, OperationError};
pub use reliable::{AbortReliableWrite, BeginReliableWrite, ExecuteReliableWrite};

use crate::link::constants::GATT_SUCCESS;
use crate::link::{LinkEvent, LinkTransport, TransportError};

/// Where an operation stands after a step.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress<T> {
    /// Waiting for another link event.
    Pending,
    /// Terminal outcome.
    Done(Result<T, GattErrorKind>),
}

impl<T> Progress<T> {
    pub fn ok(value: T) -> Self {
        Progress::Done(Ok(value))
    }

    pub fn fail(kind: GattErrorKind) -> Self {
        Progress::Done(Err(kind))
    }

    /// Pending if the request was accepted, failed otherwise.
    pub fn issued(res: Result<(), TransportError>) -> Self {
        match res {
            Ok(()) => Progress::Pending,
            Err(e) => Progress::fail(e.into()),
        }
    }
}

/// Map a link status to a unit result.
pub(crate) fn status_result(status: u8) -> Result<(), GattErrorKind> {
    if status == GATT_SUCCESS {
        Ok(())
    } else {
        Err(GattErrorKind::Gatt(status))
    }
}

/// A single request/response unit executed against the link.
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    /// Identifier used in logs and error reports.
    fn id(&self) -> String;

    /// Issue the first request.
    fn start(&mut self, link: &dyn LinkTransport) -> Progress<Self::Output>;

    /// Interpret a link event. Events unrelated to this operation return `Pending`.
    fn on_event(&mut self, event: &LinkEvent, link: &dyn LinkTransport) -> Progress<Self::Output>;

    /// Whether a link drop is part of this operation's own protocol rather
    /// than a terminal failure.
    fn survives_disconnect(&self) -> bool {
        false
    }
}
