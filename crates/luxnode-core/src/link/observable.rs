//! Link wrapper that emits attribute traffic events.

use std::sync::Arc;

use uuid::Uuid;

use super::traits::{LinkTransport, TransportError};
use crate::events::{NodeEvent, NodeObserver, PacketDirection};

/// Transport wrapper that reports every accepted outbound request.
pub struct ObservableLink {
    inner: Arc<dyn LinkTransport>,
    observer: Arc<dyn NodeObserver>,
}

impl ObservableLink {
    pub fn new(inner: Arc<dyn LinkTransport>, observer: Arc<dyn NodeObserver>) -> Self {
        Self { inner, observer }
    }

    fn report(&self, uuid: Option<Uuid>, request: &str, data: Option<&[u8]>) {
        self.observer.on_event(&NodeEvent::Attribute {
            direction: PacketDirection::Tx,
            uuid,
            request: request.to_string(),
            length: data.map_or(0, <[u8]>::len),
            data: data.map(|d| d.iter().take(32).copied().collect()),
        });
    }

    fn observed(
        &self,
        res: Result<(), TransportError>,
        uuid: Option<Uuid>,
        request: &str,
        data: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        if res.is_ok() {
            self.report(uuid, request, data);
        }
        res
    }
}

impl LinkTransport for ObservableLink {
    fn connect(&self) -> Result<(), TransportError> {
        self.observed(self.inner.connect(), None, "connect", None)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        self.observed(self.inner.disconnect(), None, "disconnect", None)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.observed(self.inner.discover_services(), None, "discover", None)
    }

    fn refresh(&self) -> Result<(), TransportError> {
        self.inner.refresh()
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.inner.has_characteristic(uuid)
    }

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), TransportError> {
        self.observed(self.inner.read_characteristic(uuid), Some(uuid), "read", None)
    }

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.observed(
            self.inner.write_characteristic(uuid, value),
            Some(uuid),
            "write",
            Some(value),
        )
    }

    fn begin_reliable_write(&self) -> Result<(), TransportError> {
        self.observed(self.inner.begin_reliable_write(), None, "begin-reliable", None)
    }

    fn execute_reliable_write(&self) -> Result<(), TransportError> {
        self.observed(
            self.inner.execute_reliable_write(),
            None,
            "execute-reliable",
            None,
        )
    }

    fn abort_reliable_write(&self) -> Result<(), TransportError> {
        self.observed(self.inner.abort_reliable_write(), None, "abort-reliable", None)
    }

    fn set_notification(&self, uuid: Uuid, enabled: bool) -> Result<(), TransportError> {
        self.inner.set_notification(uuid, enabled)
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.observed(
            self.inner
                .write_descriptor(characteristic, descriptor, value),
            Some(characteristic),
            "write-descriptor",
            Some(value),
        )
    }
}
