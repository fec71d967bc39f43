//! Characteristic and descriptor operations.

use uuid::Uuid;

use super::{GattErrorKind, Operation, Progress, status_result};
use crate::link::constants::{CCCD_ENABLE_INDICATION, CCCD_ENABLE_NOTIFICATION, CCCD_UUID};
use crate::link::{LinkEvent, LinkTransport};

fn require(link: &dyn LinkTransport, uuid: Uuid) -> Result<(), GattErrorKind> {
    if link.has_characteristic(uuid) {
        Ok(())
    } else {
        Err(GattErrorKind::PreconditionFailed(format!(
            "characteristic {uuid} not discovered"
        )))
    }
}

/// Read one characteristic value.
#[derive(Debug, Clone)]
pub struct ReadCharacteristic {
    uuid: Uuid,
}

impl ReadCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }
}

impl Operation for ReadCharacteristic {
    type Output = Vec<u8>;

    fn id(&self) -> String {
        format!("read:{}", self.uuid)
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<Vec<u8>> {
        if let Err(e) = require(link, self.uuid) {
            return Progress::fail(e);
        }
        Progress::issued(link.read_characteristic(self.uuid))
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<Vec<u8>> {
        match event {
            LinkEvent::CharacteristicRead {
                uuid,
                status,
                value,
            } if *uuid == self.uuid => Progress::Done(status_result(*status).map(|_| value.clone())),
            _ => Progress::Pending,
        }
    }
}

/// How a write is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerify {
    /// Read the characteristic back and compare with the expected value.
    ReadBack,
    /// Compare the acknowledged value (reliable-write queue echo).
    Echo,
    /// Write without response semantics; the acknowledgement is enough.
    Unverified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Writing,
    Verifying,
}

/// Write one characteristic value, optionally confirming it.
#[derive(Debug, Clone)]
pub struct WriteCharacteristic {
    uuid: Uuid,
    value: Vec<u8>,
    verify: WriteVerify,
    phase: WritePhase,
}

impl WriteCharacteristic {
    /// Write and confirm with a read-back.
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self {
            uuid,
            value,
            verify: WriteVerify::ReadBack,
            phase: WritePhase::Writing,
        }
    }

    /// Write inside a reliable-write transaction; confirmed by the queue echo.
    pub fn queued(uuid: Uuid, value: Vec<u8>) -> Self {
        Self {
            verify: WriteVerify::Echo,
            ..Self::new(uuid, value)
        }
    }

    pub fn unverified(uuid: Uuid, value: Vec<u8>) -> Self {
        Self {
            verify: WriteVerify::Unverified,
            ..Self::new(uuid, value)
        }
    }

}

impl Operation for WriteCharacteristic {
    type Output = ();

    fn id(&self) -> String {
        format!("write:{}", self.uuid)
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        if let Err(e) = require(link, self.uuid) {
            return Progress::fail(e);
        }
        self.phase = WritePhase::Writing;
        Progress::issued(link.write_characteristic(self.uuid, &self.value))
    }

    fn on_event(&mut self, event: &LinkEvent, link: &dyn LinkTransport) -> Progress<()> {
        match (self.phase, event) {
            (
                WritePhase::Writing,
                LinkEvent::CharacteristicWritten {
                    uuid,
                    status,
                    value,
                },
            ) if *uuid == self.uuid => {
                if let Err(e) = status_result(*status) {
                    return Progress::fail(e);
                }
                match self.verify {
                    WriteVerify::Unverified => Progress::ok(()),
                    WriteVerify::Echo if *value == self.value => Progress::ok(()),
                    WriteVerify::Echo => Progress::fail(GattErrorKind::WriteValueMismatch),
                    WriteVerify::ReadBack => {
                        self.phase = WritePhase::Verifying;
                        Progress::issued(link.read_characteristic(self.uuid))
                    }
                }
            }
            (
                WritePhase::Verifying,
                LinkEvent::CharacteristicRead {
                    uuid,
                    status,
                    value,
                },
            ) if *uuid == self.uuid => match status_result(*status) {
                Err(e) => Progress::fail(e),
                Ok(()) if *value == self.value => Progress::ok(()),
                Ok(()) => {
                    tracing::debug!(
                        uuid = %self.uuid,
                        expected = ?self.value,
                        actual = ?value,
                        "Read-back mismatch"
                    );
                    Progress::fail(GattErrorKind::WriteValueMismatch)
                }
            },
            _ => Progress::Pending,
        }
    }
}

/// Subscribe to notifications or indications of a characteristic.
#[derive(Debug, Clone)]
pub struct EnableIndication {
    uuid: Uuid,
    indication: bool,
}

impl EnableIndication {
    pub fn indication(uuid: Uuid) -> Self {
        Self {
            uuid,
            indication: true,
        }
    }

    pub fn notification(uuid: Uuid) -> Self {
        Self {
            uuid,
            indication: false,
        }
    }
}

impl Operation for EnableIndication {
    type Output = ();

    fn id(&self) -> String {
        format!("enable-indication:{}", self.uuid)
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        if let Err(e) = require(link, self.uuid) {
            return Progress::fail(e);
        }
        if let Err(e) = link.set_notification(self.uuid, true) {
            return Progress::fail(e.into());
        }
        let payload = if self.indication {
            CCCD_ENABLE_INDICATION
        } else {
            CCCD_ENABLE_NOTIFICATION
        };
        Progress::issued(link.write_descriptor(self.uuid, CCCD_UUID, &payload))
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        match event {
            LinkEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            } if *characteristic == self.uuid && *descriptor == CCCD_UUID => {
                Progress::Done(status_result(*status))
            }
            _ => Progress::Pending,
        }
    }
}

/// Write a value and wait for the node to answer with an indication on the
/// same characteristic.
#[derive(Debug, Clone)]
pub struct WriteAwaitIndication {
    uuid: Uuid,
    value: Vec<u8>,
}

impl WriteAwaitIndication {
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self { uuid, value }
    }
}

impl Operation for WriteAwaitIndication {
    type Output = Vec<u8>;

    fn id(&self) -> String {
        format!("write-await-indication:{}", self.uuid)
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<Vec<u8>> {
        if let Err(e) = require(link, self.uuid) {
            return Progress::fail(e);
        }
        Progress::issued(link.write_characteristic(self.uuid, &self.value))
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<Vec<u8>> {
        match event {
            LinkEvent::CharacteristicWritten { uuid, status, .. } if *uuid == self.uuid => {
                match status_result(*status) {
                    Ok(()) => Progress::Pending,
                    Err(e) => Progress::fail(e),
                }
            }
            LinkEvent::CharacteristicChanged { uuid, value } if *uuid == self.uuid => {
                Progress::ok(value.clone())
            }
            _ => Progress::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{EventSink, LinkFactory, MockLinkFactory, MockNode};
    use crate::model::{Device, DeviceFamily};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    const CHAR: Uuid = Uuid::from_u128(0xA1);

    async fn connected(node: &MockNode) -> (Arc<dyn LinkTransport>, UnboundedReceiver<LinkEvent>) {
        let factory = MockLinkFactory::new(node.clone());
        let device = Device::new(Uuid::nil(), "00:00:00:00:00:01", DeviceFamily::D4i);
        let (sink, mut rx) = EventSink::channel();
        let link = factory.open(&device, sink).await.unwrap();
        link.connect().unwrap();
        link.discover_services().unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        (link, rx)
    }

    /// Feed events to `op` until it completes.
    async fn drive<O: Operation>(
        op: &mut O,
        link: &dyn LinkTransport,
        rx: &mut UnboundedReceiver<LinkEvent>,
    ) -> Result<O::Output, GattErrorKind> {
        let mut progress = op.start(link);
        loop {
            if let Progress::Done(result) = progress {
                return result;
            }
            let event = rx.recv().await.expect("link went quiet");
            progress = op.on_event(&event, link);
        }
    }

    #[tokio::test]
    async fn test_read_requires_discovered_characteristic() {
        let node = MockNode::new();
        let (link, mut rx) = connected(&node).await;
        let mut op = ReadCharacteristic::new(CHAR);
        assert!(matches!(
            drive(&mut op, link.as_ref(), &mut rx).await,
            Err(GattErrorKind::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_write_verified_by_readback() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[0]);
        let (link, mut rx) = connected(&node).await;

        let mut op = WriteCharacteristic::new(CHAR, vec![3]);
        assert_eq!(drive(&mut op, link.as_ref(), &mut rx).await, Ok(()));
        assert_eq!(node.attribute(CHAR), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_write_mismatch_when_node_ignores_value() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[0]);
        node.ignore_writes(CHAR);
        let (link, mut rx) = connected(&node).await;

        let mut op = WriteCharacteristic::new(CHAR, vec![3]);
        assert_eq!(
            drive(&mut op, link.as_ref(), &mut rx).await,
            Err(GattErrorKind::WriteValueMismatch)
        );
    }

    #[tokio::test]
    async fn test_unverified_write_skips_readback() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[0]);
        node.ignore_writes(CHAR);
        let (link, mut rx) = connected(&node).await;

        let mut op = WriteCharacteristic::unverified(CHAR, vec![3]);
        assert_eq!(drive(&mut op, link.as_ref(), &mut rx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_write_await_indication_returns_payload() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[]);
        node.set_write_hook(
            CHAR,
            Box::new(|value| crate::link::WriteEffect {
                indicate: vec![(CHAR, value.iter().rev().copied().collect())],
                ..Default::default()
            }),
        );
        let (link, mut rx) = connected(&node).await;

        let mut sub = EnableIndication::indication(CHAR);
        drive(&mut sub, link.as_ref(), &mut rx).await.unwrap();
        assert!(node.is_subscribed(CHAR));

        let mut op = WriteAwaitIndication::new(CHAR, vec![1, 2, 3]);
        assert_eq!(
            drive(&mut op, link.as_ref(), &mut rx).await,
            Ok(vec![3, 2, 1])
        );
    }
}
