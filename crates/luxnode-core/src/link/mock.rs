//! Mock link for testing.
//!
//! [`MockNode`] is an in-memory GATT server shared by every link opened
//! through [`MockLinkFactory`]. It answers requests synchronously through the
//! link's event sink, so tests exercise the same dispatch path as a radio.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::constants::{
    CCCD_DISABLE, CCCD_UUID, GATT_CONN_TERMINATE_LOCAL_HOST, GATT_CONN_TERMINATE_PEER_USER,
    GATT_SUCCESS, MAX_LINK_HANDLES,
};
use super::traits::{EventSink, LinkEvent, LinkFactory, LinkTransport, TransportError};
use crate::model::Device;

/// Request captured by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    Connect,
    Disconnect,
    DiscoverServices,
    Refresh,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    BeginReliableWrite,
    ExecuteReliableWrite,
    AbortReliableWrite,
    SetNotification(Uuid, bool),
    WriteDescriptor(Uuid, Vec<u8>),
}

/// How the node answers the next connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Report a disconnect with this status.
    Fail(u8),
    /// Accept and never answer.
    Silent,
}

/// Side effects of a hooked write.
#[derive(Debug, Default)]
pub struct WriteEffect {
    /// Attribute values to store.
    pub store: Vec<(Uuid, Vec<u8>)>,
    /// Values to push as indications (only delivered when enabled via CCCD).
    pub indicate: Vec<(Uuid, Vec<u8>)>,
    /// Reveal locked characteristics on the next discovery.
    pub unlock: bool,
}

/// Device-side reaction to a write on one characteristic.
pub type WriteHook = Box<dyn FnMut(&[u8]) -> WriteEffect + Send>;

#[derive(Default)]
struct NodeState {
    attributes: HashMap<Uuid, Vec<u8>>,
    locked: HashSet<Uuid>,
    unlocked: bool,
    cache: Option<HashSet<Uuid>>,
    connected: bool,
    connect_script: VecDeque<ConnectBehavior>,
    reliable: Option<Vec<(Uuid, Vec<u8>)>>,
    hooks: HashMap<Uuid, WriteHook>,
    subscribed: HashSet<Uuid>,
    read_failures: HashMap<Uuid, u8>,
    silent_reads: HashSet<Uuid>,
    ignored_writes: HashSet<Uuid>,
    execute_failure: Option<u8>,
    silent_disconnect: bool,
    deny_permission: bool,
    requests: Vec<MockRequest>,
    sink: Option<EventSink>,
    open_handles: usize,
    opens: usize,
    closes: usize,
}

/// Simulated controller node.
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or overwrite a characteristic.
    pub fn set_attribute(&self, uuid: Uuid, value: &[u8]) {
        self.state().attributes.insert(uuid, value.to_vec());
    }

    /// Add a characteristic that stays hidden until a hook unlocks the node.
    pub fn set_locked_attribute(&self, uuid: Uuid, value: &[u8]) {
        let mut state = self.state();
        state.attributes.insert(uuid, value.to_vec());
        state.locked.insert(uuid);
    }

    pub fn attribute(&self, uuid: Uuid) -> Option<Vec<u8>> {
        self.state().attributes.get(&uuid).cloned()
    }

    pub fn set_write_hook(&self, uuid: Uuid, hook: WriteHook) {
        self.state().hooks.insert(uuid, hook);
    }

    /// Script the next connect attempts.
    pub fn queue_connect(&self, behavior: ConnectBehavior) {
        self.state().connect_script.push_back(behavior);
    }

    pub fn fail_reads(&self, uuid: Uuid, status: u8) {
        self.state().read_failures.insert(uuid, status);
    }

    /// Accept reads of `uuid` but never answer them.
    pub fn silence_reads(&self, uuid: Uuid) {
        self.state().silent_reads.insert(uuid);
    }

    pub fn clear_silenced_reads(&self) {
        self.state().silent_reads.clear();
    }

    /// Acknowledge writes to `uuid` without storing them.
    pub fn ignore_writes(&self, uuid: Uuid) {
        self.state().ignored_writes.insert(uuid);
    }

    pub fn fail_execute(&self, status: u8) {
        self.state().execute_failure = Some(status);
    }

    /// Accept disconnect requests but never report the link going down.
    pub fn silence_disconnect(&self) {
        self.state().silent_disconnect = true;
    }

    pub fn deny_permission(&self, deny: bool) {
        self.state().deny_permission = deny;
    }

    /// Simulate the node dropping the radio link.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        if let Some(sink) = &state.sink {
            sink.emit(LinkEvent::ConnectionStateChanged {
                status: GATT_CONN_TERMINATE_PEER_USER,
                connected: false,
            });
        }
    }

    /// Push an unsolicited event into the current link.
    pub fn emit(&self, event: LinkEvent) {
        if let Some(sink) = &self.state().sink {
            sink.emit(event);
        }
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.state().subscribed.contains(&uuid)
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    fn visible(state: &NodeState) -> HashSet<Uuid> {
        state
            .attributes
            .keys()
            .filter(|uuid| state.unlocked || !state.locked.contains(uuid))
            .copied()
            .collect()
    }

    /// Store a value, running the hook if one is installed.
    fn apply_write(state: &mut NodeState, uuid: Uuid, value: &[u8]) -> Vec<(Uuid, Vec<u8>)> {
        if let Some(hook) = state.hooks.get_mut(&uuid) {
            let effect = hook(value);
            for (target, stored) in effect.store {
                state.attributes.insert(target, stored);
            }
            if effect.unlock {
                state.unlocked = true;
            }
            return effect.indicate;
        }
        if !state.ignored_writes.contains(&uuid) {
            state.attributes.insert(uuid, value.to_vec());
        }
        Vec::new()
    }
}

/// Mock link bound to one [`MockNode`].
pub struct MockLink {
    node: MockNode,
    sink: EventSink,
    closed: AtomicBool,
}

impl MockLink {
    fn guard(&self, request: MockRequest) -> Result<MutexGuard<'_, NodeState>, TransportError> {
        let mut state = self.node.state();
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if state.deny_permission {
            return Err(TransportError::PermissionDenied);
        }
        state.requests.push(request);
        Ok(state)
    }

    fn connected_guard(
        &self,
        request: MockRequest,
    ) -> Result<MutexGuard<'_, NodeState>, TransportError> {
        let state = self.guard(request)?;
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(state)
    }

    fn require_cached(state: &NodeState, uuid: Uuid) -> Result<(), TransportError> {
        match &state.cache {
            Some(cache) if cache.contains(&uuid) => Ok(()),
            _ => Err(TransportError::UnknownCharacteristic(uuid)),
        }
    }

    fn indicate(&self, state: &NodeState, indications: Vec<(Uuid, Vec<u8>)>) {
        for (uuid, value) in indications {
            if state.subscribed.contains(&uuid) {
                self.sink
                    .emit(LinkEvent::CharacteristicChanged { uuid, value });
            }
        }
    }
}

impl LinkTransport for MockLink {
    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.guard(MockRequest::Connect)?;
        match state.connect_script.pop_front() {
            Some(ConnectBehavior::Fail(status)) => {
                self.sink.emit(LinkEvent::ConnectionStateChanged {
                    status,
                    connected: false,
                });
            }
            Some(ConnectBehavior::Silent) => {}
            None => {
                state.connected = true;
                self.sink.emit(LinkEvent::ConnectionStateChanged {
                    status: GATT_SUCCESS,
                    connected: true,
                });
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.guard(MockRequest::Disconnect)?;
        if state.silent_disconnect {
            return Ok(());
        }
        state.connected = false;
        state.reliable = None;
        self.sink.emit(LinkEvent::ConnectionStateChanged {
            status: GATT_CONN_TERMINATE_LOCAL_HOST,
            connected: false,
        });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.node.state();
        state.connected = false;
        state.cache = None;
        state.subscribed.clear();
        state.open_handles = state.open_handles.saturating_sub(1);
        state.closes += 1;
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let mut state = self.connected_guard(MockRequest::DiscoverServices)?;
        state.cache = Some(MockNode::visible(&state));
        self.sink
            .emit(LinkEvent::ServicesDiscovered { status: GATT_SUCCESS });
        Ok(())
    }

    fn refresh(&self) -> Result<(), TransportError> {
        let mut state = self.guard(MockRequest::Refresh)?;
        state.cache = None;
        Ok(())
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        let state = self.node.state();
        state
            .cache
            .as_ref()
            .is_some_and(|cache| cache.contains(&uuid))
    }

    fn read_characteristic(&self, uuid: Uuid) -> Result<(), TransportError> {
        let state = self.connected_guard(MockRequest::Read(uuid))?;
        Self::require_cached(&state, uuid)?;
        if state.silent_reads.contains(&uuid) {
            return Ok(());
        }
        let event = match state.read_failures.get(&uuid) {
            Some(&status) => LinkEvent::CharacteristicRead {
                uuid,
                status,
                value: Vec::new(),
            },
            None => LinkEvent::CharacteristicRead {
                uuid,
                status: GATT_SUCCESS,
                value: state.attributes.get(&uuid).cloned().unwrap_or_default(),
            },
        };
        self.sink.emit(event);
        Ok(())
    }

    fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let mut state = self.connected_guard(MockRequest::Write(uuid, value.to_vec()))?;
        Self::require_cached(&state, uuid)?;

        if let Some(queue) = state.reliable.as_mut() {
            queue.push((uuid, value.to_vec()));
            self.sink.emit(LinkEvent::CharacteristicWritten {
                uuid,
                status: GATT_SUCCESS,
                value: value.to_vec(),
            });
            return Ok(());
        }

        let indications = MockNode::apply_write(&mut state, uuid, value);
        self.sink.emit(LinkEvent::CharacteristicWritten {
            uuid,
            status: GATT_SUCCESS,
            value: value.to_vec(),
        });
        self.indicate(&state, indications);
        Ok(())
    }

    fn begin_reliable_write(&self) -> Result<(), TransportError> {
        let mut state = self.connected_guard(MockRequest::BeginReliableWrite)?;
        state.reliable = Some(Vec::new());
        Ok(())
    }

    fn execute_reliable_write(&self) -> Result<(), TransportError> {
        let mut state = self.connected_guard(MockRequest::ExecuteReliableWrite)?;
        let queue = state
            .reliable
            .take()
            .ok_or(TransportError::NoReliableWrite)?;

        if let Some(status) = state.execute_failure.take() {
            self.sink.emit(LinkEvent::ReliableWriteCompleted { status });
            return Ok(());
        }

        let mut indications = Vec::new();
        for (uuid, value) in queue {
            indications.extend(MockNode::apply_write(&mut state, uuid, &value));
        }
        self.sink
            .emit(LinkEvent::ReliableWriteCompleted { status: GATT_SUCCESS });
        self.indicate(&state, indications);
        Ok(())
    }

    fn abort_reliable_write(&self) -> Result<(), TransportError> {
        let mut state = self.guard(MockRequest::AbortReliableWrite)?;
        state.reliable = None;
        Ok(())
    }

    fn set_notification(&self, uuid: Uuid, enabled: bool) -> Result<(), TransportError> {
        let state = self.guard(MockRequest::SetNotification(uuid, enabled))?;
        Self::require_cached(&state, uuid)
    }

    fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let mut state =
            self.connected_guard(MockRequest::WriteDescriptor(characteristic, value.to_vec()))?;
        Self::require_cached(&state, characteristic)?;
        if descriptor == CCCD_UUID {
            if value == CCCD_DISABLE {
                state.subscribed.remove(&characteristic);
            } else {
                state.subscribed.insert(characteristic);
            }
        }
        self.sink.emit(LinkEvent::DescriptorWritten {
            characteristic,
            descriptor,
            status: GATT_SUCCESS,
        });
        Ok(())
    }
}

/// Factory handing out links to one shared [`MockNode`].
#[derive(Clone, Default)]
pub struct MockLinkFactory {
    node: MockNode,
}

impl MockLinkFactory {
    pub fn new(node: MockNode) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &MockNode {
        &self.node
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn open(
        &self,
        _device: &Device,
        sink: EventSink,
    ) -> Result<Arc<dyn LinkTransport>, TransportError> {
        {
            let mut state = self.node.state();
            if state.open_handles >= MAX_LINK_HANDLES {
                return Err(TransportError::Rejected(format!(
                    "link handle limit of {MAX_LINK_HANDLES} reached"
                )));
            }
            state.open_handles += 1;
            state.opens += 1;
            state.sink = Some(sink.clone());
        }
        Ok(Arc::new(MockLink {
            node: self.node.clone(),
            sink,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceFamily;

    const CHAR: Uuid = Uuid::from_u128(0x1234);

    async fn open(node: &MockNode) -> (Arc<dyn LinkTransport>, tokio::sync::mpsc::UnboundedReceiver<LinkEvent>) {
        let factory = MockLinkFactory::new(node.clone());
        let device = Device::new(Uuid::nil(), "00:00:00:00:00:01", DeviceFamily::D4i);
        let (sink, rx) = EventSink::channel();
        (factory.open(&device, sink).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_mock_read_after_discovery() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[7, 8]);
        let (link, mut rx) = open(&node).await;

        // Not connected yet
        assert!(link.read_characteristic(CHAR).is_err());

        link.connect().unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::ConnectionStateChanged {
                status: GATT_SUCCESS,
                connected: true
            }
        );

        // Service table not cached yet
        assert!(matches!(
            link.read_characteristic(CHAR),
            Err(TransportError::UnknownCharacteristic(_))
        ));

        link.discover_services().unwrap();
        rx.recv().await.unwrap();
        link.read_characteristic(CHAR).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::CharacteristicRead {
                uuid: CHAR,
                status: GATT_SUCCESS,
                value: vec![7, 8]
            }
        );
    }

    #[tokio::test]
    async fn test_mock_reliable_write_applies_on_execute() {
        let node = MockNode::new();
        node.set_attribute(CHAR, &[0]);
        let (link, _rx) = open(&node).await;
        link.connect().unwrap();
        link.discover_services().unwrap();

        link.begin_reliable_write().unwrap();
        link.write_characteristic(CHAR, &[5]).unwrap();
        assert_eq!(node.attribute(CHAR), Some(vec![0]));

        link.execute_reliable_write().unwrap();
        assert_eq!(node.attribute(CHAR), Some(vec![5]));
    }

    #[tokio::test]
    async fn test_mock_close_releases_handle_once() {
        let node = MockNode::new();
        let (link, _rx) = open(&node).await;
        assert_eq!(node.open_handles(), 1);

        link.close();
        link.close();
        assert_eq!(node.closes(), 1);
        assert_eq!(node.open_handles(), 0);
        assert!(matches!(link.connect(), Err(TransportError::Closed)));
    }
}
