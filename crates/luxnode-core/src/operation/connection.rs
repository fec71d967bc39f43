//! Link lifecycle operations.

use super::{Operation, Progress, status_result};
use crate::link::constants::{GATT_ERROR, GATT_SUCCESS};
use crate::link::{LinkEvent, LinkTransport};
use crate::operation::GattErrorKind;

/// Open the radio link.
///
/// A disconnect reported while connecting is this attempt's failure, not a
/// link loss; the retry loop decides what happens next.
#[derive(Debug, Default)]
pub struct Connect;

impl Operation for Connect {
    type Output = ();

    fn id(&self) -> String {
        "connect".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::issued(link.connect())
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        match event {
            LinkEvent::ConnectionStateChanged {
                connected: true,
                status,
            } => Progress::Done(status_result(*status)),
            LinkEvent::ConnectionStateChanged {
                connected: false,
                status,
            } => {
                let status = if *status == GATT_SUCCESS {
                    GATT_ERROR
                } else {
                    *status
                };
                Progress::fail(GattErrorKind::Gatt(status))
            }
            _ => Progress::Pending,
        }
    }

    fn survives_disconnect(&self) -> bool {
        true
    }
}

/// Close the radio link. Completes on the disconnect event.
#[derive(Debug, Default)]
pub struct Disconnect;

impl Operation for Disconnect {
    type Output = ();

    fn id(&self) -> String {
        "disconnect".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::issued(link.disconnect())
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        match event {
            LinkEvent::ConnectionStateChanged {
                connected: false, ..
            } => Progress::ok(()),
            _ => Progress::Pending,
        }
    }

    fn survives_disconnect(&self) -> bool {
        true
    }
}

/// Populate the link's service table.
#[derive(Debug, Default)]
pub struct DiscoverServices;

impl Operation for DiscoverServices {
    type Output = ();

    fn id(&self) -> String {
        "discover-services".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::issued(link.discover_services())
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        match event {
            LinkEvent::ServicesDiscovered { status } => Progress::Done(status_result(*status)),
            LinkEvent::ConnectionStateChanged {
                connected: false,
                status,
            } => Progress::fail(GattErrorKind::Gatt(*status)),
            _ => Progress::Pending,
        }
    }

    fn survives_disconnect(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::constants::GATT_CONN_TIMEOUT;
    use crate::link::{EventSink, LinkFactory, MockLinkFactory, MockNode};
    use crate::model::{Device, DeviceFamily};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_connect_failure_reports_status() {
        let factory = MockLinkFactory::new(MockNode::new());
        let (sink, _rx) = EventSink::channel();
        let device = Device::new(Uuid::nil(), "00:00:00:00:00:01", DeviceFamily::Bdc);
        let link = factory.open(&device, sink).await.unwrap();

        let mut op = Connect;
        assert_eq!(op.start(link.as_ref()), Progress::Pending);
        let event = LinkEvent::ConnectionStateChanged {
            status: GATT_CONN_TIMEOUT,
            connected: false,
        };
        assert_eq!(
            op.on_event(&event, link.as_ref()),
            Progress::fail(GattErrorKind::Gatt(GATT_CONN_TIMEOUT))
        );
    }

    #[tokio::test]
    async fn test_discover_ignores_unrelated_events() {
        let factory = MockLinkFactory::new(MockNode::new());
        let (sink, _rx) = EventSink::channel();
        let device = Device::new(Uuid::nil(), "00:00:00:00:00:01", DeviceFamily::Bdc);
        let link = factory.open(&device, sink).await.unwrap();

        let mut op = DiscoverServices;
        let mtu = LinkEvent::MtuChanged {
            mtu: 247,
            status: 0,
        };
        assert_eq!(op.on_event(&mtu, link.as_ref()), Progress::Pending);
        assert_eq!(
            op.on_event(&LinkEvent::ServicesDiscovered { status: 0 }, link.as_ref()),
            Progress::ok(())
        );
    }
}
